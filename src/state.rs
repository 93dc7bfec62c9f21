//! Worker lifecycle state machine.
//!
//! ```text
//! Idle -> Starting -> Ready -> (Stopping | Crashed) -> Idle
//! ```
//!
//! `Crashed` is transient: the restart policy either moves it back to
//! `Starting` or settles it in `Idle`. `Stopping` is only entered by an
//! explicit stop and always ends in `Idle`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Idle,
    Starting,
    Ready {
        port: u16,
    },
    Crashed,
    Stopping,
}

impl LifecycleState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready { .. })
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            LifecycleState::Ready { port } => Some(*port),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition(&self, next: &LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Idle, Stopping)
                | (Starting, Ready { .. })
                | (Starting, Crashed)
                | (Starting, Idle)
                | (Starting, Stopping)
                | (Ready { .. }, Crashed)
                | (Ready { .. }, Idle)
                | (Ready { .. }, Stopping)
                | (Crashed, Starting)
                | (Crashed, Idle)
                | (Crashed, Stopping)
                | (Stopping, Idle)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => f.write_str("idle"),
            LifecycleState::Starting => f.write_str("starting"),
            LifecycleState::Ready { port } => write!(f, "ready (port {port})"),
            LifecycleState::Crashed => f.write_str("crashed"),
            LifecycleState::Stopping => f.write_str("stopping"),
        }
    }
}
