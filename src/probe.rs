//! Readiness probing: "process started" is not "service ready".

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ReadinessSettings;
use crate::diagnostics::DiagnosticLog;
use crate::error::{SupervisorError, SupervisorResult};
use crate::launcher::WorkerHandle;
use crate::transport::{Method, Transport, WorkerRequest};

pub const HEALTH_PATH: &str = "/api/health";

/// Polls the worker's health endpoint until it answers or the budget runs out.
#[derive(Clone)]
pub struct ReadinessProber {
    transport: Arc<dyn Transport>,
    interval: Duration,
    attempts: u32,
    request_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(transport: Arc<dyn Transport>, settings: &ReadinessSettings) -> Self {
        Self {
            transport,
            interval: settings.interval().max(Duration::from_millis(1)),
            attempts: settings.attempts.max(1),
            request_timeout: settings.request_timeout(),
        }
    }

    /// Returns the 1-based attempt that succeeded.
    ///
    /// Attempts start on a fixed-rate schedule and the whole probe never runs
    /// past `attempts × interval`, however slowly the worker answers. An exit
    /// observed before any attempt aborts immediately with
    /// `WorkerTerminatedDuringStartup` instead of waiting out the budget.
    pub async fn wait_ready(
        &self,
        handle: &WorkerHandle,
        diagnostics: &DiagnosticLog,
    ) -> SupervisorResult<u32> {
        let deadline = Instant::now() + self.interval * self.attempts;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut attempt = 0;
        while attempt < self.attempts {
            ticker.tick().await;
            if Instant::now() >= deadline {
                break;
            }
            attempt += 1;
            check_alive(handle, diagnostics)?;

            let request = WorkerRequest::new(
                Method::GET,
                handle.port(),
                HEALTH_PATH,
                self.request_timeout,
            );
            let response = match tokio::time::timeout_at(deadline, self.transport.send(request)).await
            {
                Ok(response) => response,
                Err(_) => {
                    log::debug!("Health check {attempt}: cut off by the readiness budget");
                    break;
                }
            };
            match response {
                Ok(response) if response.is_success() => {
                    log::info!(
                        "Worker ready on port {} after {} health check(s)",
                        handle.port(),
                        attempt
                    );
                    return Ok(attempt);
                }
                Ok(response) => {
                    log::debug!("Health check {attempt}: HTTP {}", response.status);
                }
                Err(e) => {
                    log::debug!("Health check {attempt}: {e}");
                }
            }
        }

        check_alive(handle, diagnostics)?;
        log::warn!(
            "Worker on port {} not ready after {} health checks",
            handle.port(),
            attempt
        );
        Err(SupervisorError::ReadinessTimeout {
            attempts: self.attempts,
        })
    }
}

fn check_alive(handle: &WorkerHandle, diagnostics: &DiagnosticLog) -> SupervisorResult<()> {
    match handle.exit_status() {
        Some(exit) => Err(SupervisorError::WorkerTerminatedDuringStartup {
            code: exit.code,
            last_error: diagnostics.last_error_line().or(exit.error),
        }),
        None => Ok(()),
    }
}
