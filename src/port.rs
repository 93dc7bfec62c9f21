//! Loopback port allocation for the worker.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use crate::error::{SupervisorError, SupervisorResult};

/// Ask the OS for a currently unbound loopback port.
///
/// The throwaway listener is closed before returning, so there is a short
/// window in which another process could take the port. The readiness probe
/// catches that case as a startup failure.
pub fn allocate_port() -> SupervisorResult<u16> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    let listener =
        TcpListener::bind(addr).map_err(|e| SupervisorError::PortAllocation(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| SupervisorError::PortAllocation(e.to_string()))?
        .port();
    drop(listener);

    if port == 0 {
        return Err(SupervisorError::PortAllocation(
            "OS returned port 0".to_string(),
        ));
    }

    log::debug!("Allocated worker port {port}");
    Ok(port)
}
