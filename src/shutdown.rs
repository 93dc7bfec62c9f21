//! Graceful-then-forceful worker termination with a hard deadline.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::launcher::WorkerHandle;

/// How `stop()` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// There was no worker to stop.
    NotRunning,
    /// The worker exited after the graceful request (or had already exited).
    Exited { code: Option<i32> },
    /// The worker ignored the graceful request and was killed.
    ForceKilled,
    /// The worker was still alive at the overall deadline.
    TimedOut,
}

/// Ask the worker to exit, kill it after `force_kill_after`, and give up at `deadline`.
///
/// Never waits past `deadline`.
pub async fn terminate_worker(
    handle: &WorkerHandle,
    force_kill_after: Duration,
    deadline: Instant,
) -> ShutdownOutcome {
    if let Some(exit) = handle.exit_status() {
        return ShutdownOutcome::Exited { code: exit.code };
    }

    log::info!("Requesting worker (pid {:?}) to exit", handle.pid());
    if !handle.terminate() {
        log::debug!("Worker reaper already gone");
    }

    let force_at = (Instant::now() + force_kill_after).min(deadline);
    tokio::select! {
        exit = handle.wait() => {
            log::info!("Worker exited with code {:?}", exit.code);
            return ShutdownOutcome::Exited { code: exit.code };
        }
        _ = tokio::time::sleep_until(force_at) => {}
    }

    log::warn!(
        "Worker ignored termination for {:?}, killing it",
        force_kill_after
    );
    handle.kill();

    match tokio::time::timeout_at(deadline, handle.wait()).await {
        Ok(_) => ShutdownOutcome::ForceKilled,
        Err(_) => {
            log::error!(
                "Worker (pid {:?}) still alive at shutdown deadline, abandoning it",
                handle.pid()
            );
            ShutdownOutcome::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{ProcessSignal, WorkerExit};
    use tokio::sync::{mpsc, watch};

    /// A pretend worker that exits on the signals it "honors".
    fn fake_worker(honors_terminate: bool, honors_kill: bool) -> WorkerHandle {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let code = match signal {
                    ProcessSignal::Terminate if honors_terminate => Some(0),
                    ProcessSignal::Kill if honors_kill => None,
                    _ => continue,
                };
                let _ = exit_tx.send(Some(WorkerExit { code, error: None }));
                break;
            }
            // Keep the exit sender alive so waiters don't see a lost reaper.
            std::future::pending::<()>().await;
        });
        WorkerHandle::new(Some(7), 5000, signal_tx, exit_rx)
    }

    fn budget() -> (Duration, Instant) {
        (
            Duration::from_millis(3000),
            Instant::now() + Duration::from_millis(5000),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_exit() {
        let handle = fake_worker(true, true);
        let (force, deadline) = budget();
        let started = Instant::now();

        let outcome = terminate_worker(&handle, force, deadline).await;
        assert_eq!(outcome, ShutdownOutcome::Exited { code: Some(0) });
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_kill_after_timeout() {
        let handle = fake_worker(false, true);
        let (force, deadline) = budget();
        let started = Instant::now();

        let outcome = terminate_worker(&handle, force, deadline).await;
        assert_eq!(outcome, ShutdownOutcome::ForceKilled);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_unkillable_worker() {
        let handle = fake_worker(false, false);
        let (force, deadline) = budget();

        let outcome = terminate_worker(&handle, force, deadline).await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut);
        assert!(Instant::now() >= deadline);
        assert!(Instant::now() < deadline + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_already_exited() {
        let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
        let (_exit_tx, exit_rx) = watch::channel(Some(WorkerExit {
            code: Some(1),
            error: None,
        }));
        let handle = WorkerHandle::new(None, 5000, signal_tx, exit_rx);
        let (force, deadline) = budget();

        assert_eq!(
            terminate_worker(&handle, force, deadline).await,
            ShutdownOutcome::Exited { code: Some(1) }
        );
    }
}
