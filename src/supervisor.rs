//! Supervisor
//!
//! Owns the worker for the lifetime of the application: launches it, waits
//! for readiness, restarts it with backoff when it crashes, routes host
//! requests to it, and shuts it down.
//!
//! The lifecycle state lives in a `watch` channel and is only written by the
//! methods here, always while holding the control mutex, so status events go
//! out in the same order as the transitions they describe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::RequestClient;
use crate::config::SupervisorConfig;
use crate::diagnostics::{DiagnosticLine, DiagnosticLog};
use crate::error::{SupervisorError, SupervisorResult};
use crate::events::{EventSink, EventStream, StatusEvent};
use crate::launcher::{ProcessLauncher, Spawner, WorkerExit, WorkerHandle};
use crate::models::{DownloadOptions, JobRecord, VideoInfo};
use crate::port::allocate_port;
use crate::probe::ReadinessProber;
use crate::restart::{RestartDecision, RestartPolicy};
use crate::shutdown::{terminate_worker, ShutdownOutcome};
use crate::state::LifecycleState;
use crate::tracker::JobTracker;
use crate::transport::{HttpTransport, Transport};
use crate::validate::{validate_download, validate_source_url};

/// How long a worker that failed its startup gets to die after being killed.
const STARTUP_KILL_GRACE: Duration = Duration::from_secs(2);

/// Mutable supervisor fields, serialized by one async mutex.
struct Control {
    /// False only while an intentional stop is in progress or done.
    auto_restart: bool,
    stopped: bool,
    /// Restart budget exhausted; stays down until the application restarts.
    given_up: bool,
    worker: Option<WorkerHandle>,
    restart: RestartPolicy,
    last_error: Option<SupervisorError>,
    loop_task: Option<JoinHandle<()>>,
}

struct Shared {
    config: SupervisorConfig,
    spawner: Arc<dyn Spawner>,
    prober: ReadinessProber,
    client: RequestClient,
    tracker: JobTracker,
    diagnostics: DiagnosticLog,
    events: EventSink,
    state_tx: watch::Sender<LifecycleState>,
    shutdown_tx: watch::Sender<bool>,
    control: Mutex<Control>,
}

/// Host-facing handle. Cheap to clone; all clones drive the same worker.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Supervisor for the real worker process over HTTP.
    pub fn new(config: SupervisorConfig) -> SupervisorResult<(Self, EventStream)> {
        let spawner: Arc<dyn Spawner> = Arc::new(ProcessLauncher::new(&config));
        let transport = HttpTransport::new().map_err(|e| {
            log::error!("Could not build worker HTTP client: {e}");
            SupervisorError::HttpClient(e.to_string())
        })?;
        let transport: Arc<dyn Transport> = Arc::new(transport);
        Ok(Self::with_parts(config, spawner, transport))
    }

    /// Supervisor with injected process and network seams.
    pub fn with_parts(
        config: SupervisorConfig,
        spawner: Arc<dyn Spawner>,
        transport: Arc<dyn Transport>,
    ) -> (Self, EventStream) {
        let (events, stream) = EventSink::channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        let prober = ReadinessProber::new(transport.clone(), &config.readiness);
        let client = RequestClient::new(transport, state_rx, config.requests.timeout());
        let tracker = JobTracker::new(client.clone(), events.clone(), config.jobs.poll_interval());
        let diagnostics = DiagnosticLog::new(config.diagnostics_capacity);
        let restart = RestartPolicy::from_settings(&config.restart);

        let shared = Shared {
            config,
            spawner,
            prober,
            client,
            tracker,
            diagnostics,
            events,
            state_tx,
            shutdown_tx,
            control: Mutex::new(Control {
                auto_restart: true,
                stopped: false,
                given_up: false,
                worker: None,
                restart,
                last_error: None,
                loop_task: None,
            }),
        };

        (
            Self {
                shared: Arc::new(shared),
            },
            stream,
        )
    }

    /// Launch the worker and wait until it is ready.
    ///
    /// Idempotent: while a start is in flight, further calls join it.
    /// Internal restarts are invisible here; this resolves with an error only
    /// once the supervisor settles back in `Idle`.
    pub async fn start(&self) -> SupervisorResult<()> {
        let mut state_rx = self.shared.state_tx.subscribe();
        {
            let mut ctl = self.shared.control.lock().await;
            if ctl.stopped {
                return Err(SupervisorError::ShuttingDown);
            }
            if ctl.given_up {
                return Err(ctl
                    .last_error
                    .clone()
                    .unwrap_or(SupervisorError::NotReady));
            }

            let current = *self.shared.state_tx.borrow();
            match current {
                LifecycleState::Ready { .. } => return Ok(()),
                LifecycleState::Stopping => return Err(SupervisorError::ShuttingDown),
                LifecycleState::Starting | LifecycleState::Crashed => {
                    log::debug!("Start requested while {current}; joining");
                }
                LifecycleState::Idle => {
                    ctl.last_error = None;
                    ctl.restart.reset();
                    self.shared.set_state(LifecycleState::Starting);
                    self.shared.events.status(StatusEvent::Starting);
                    let shared = self.shared.clone();
                    ctl.loop_task = Some(tokio::spawn(supervise(shared)));
                }
            }
        }

        let settled = state_rx
            .wait_for(|s| {
                matches!(
                    s,
                    LifecycleState::Ready { .. } | LifecycleState::Idle | LifecycleState::Stopping
                )
            })
            .await
            .map(|s| *s)
            .map_err(|_| SupervisorError::ShuttingDown)?;

        match settled {
            LifecycleState::Ready { .. } => Ok(()),
            _ => {
                let ctl = self.shared.control.lock().await;
                if ctl.stopped {
                    Err(SupervisorError::ShuttingDown)
                } else {
                    Err(ctl.last_error.clone().unwrap_or(SupervisorError::NotReady))
                }
            }
        }
    }

    /// Cancel outstanding jobs and terminate the worker.
    ///
    /// Terminal for this supervisor: it never restarts afterwards. Resolves
    /// within the configured overall timeout even if the worker misbehaves.
    pub async fn stop(&self) -> ShutdownOutcome {
        let shutdown = &self.shared.config.shutdown;
        let deadline = Instant::now() + shutdown.overall_timeout();

        {
            let mut ctl = self.shared.control.lock().await;
            if ctl.stopped {
                return ShutdownOutcome::NotRunning;
            }
            ctl.stopped = true;
            ctl.auto_restart = false;
        }
        let _ = self.shared.shutdown_tx.send(true);
        log::info!("Stopping supervisor");

        // Cancel while the worker can still be reached, leaving the rest of
        // the budget for termination.
        let cancel_deadline = (Instant::now() + shutdown.cancel_timeout()).min(deadline);
        if tokio::time::timeout_at(cancel_deadline, self.shared.tracker.shutdown())
            .await
            .is_err()
        {
            log::warn!(
                "Job cancellation did not finish within {:?}, terminating anyway",
                shutdown.cancel_timeout()
            );
        }

        let worker = {
            let mut ctl = self.shared.control.lock().await;
            self.shared.set_state(LifecycleState::Stopping);
            if let Some(task) = ctl.loop_task.take() {
                task.abort();
            }
            ctl.worker.clone()
        };

        let outcome = match &worker {
            Some(handle) => {
                terminate_worker(handle, shutdown.force_kill_after(), deadline).await
            }
            None => ShutdownOutcome::NotRunning,
        };

        {
            let mut ctl = self.shared.control.lock().await;
            ctl.worker = None;
            self.shared.set_state(LifecycleState::Idle);
            self.shared.events.status(StatusEvent::Stopped);
        }
        log::info!("Supervisor stopped: {:?}", outcome);
        outcome
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state_tx.borrow().is_ready()
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state_tx.borrow()
    }

    /// Watch lifecycle transitions directly.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state_tx.subscribe()
    }

    /// Port of the ready worker.
    pub fn port(&self) -> Option<u16> {
        self.state().port()
    }

    pub async fn worker_pid(&self) -> Option<u32> {
        let ctl = self.shared.control.lock().await;
        ctl.worker.as_ref().and_then(WorkerHandle::pid)
    }

    /// Consecutive failures since the last successful readiness.
    pub async fn restart_failures(&self) -> u32 {
        self.shared.control.lock().await.restart.failures()
    }

    pub async fn last_error(&self) -> Option<SupervisorError> {
        self.shared.control.lock().await.last_error.clone()
    }

    /// Recent worker output, oldest first.
    pub fn diagnostics(&self) -> Vec<DiagnosticLine> {
        self.shared.diagnostics.snapshot()
    }

    pub fn export_diagnostics(&self) -> String {
        self.shared.diagnostics.export()
    }

    pub fn tracked_jobs(&self) -> Vec<String> {
        self.shared.tracker.tracked_ids()
    }

    pub async fn get_video_info(&self, url: &str) -> SupervisorResult<VideoInfo> {
        let url = validate_source_url(url)?;
        self.shared.client.get_video_info(&url).await
    }

    /// Start a download and track it. Progress arrives on the event stream.
    pub async fn start_download(&self, mut options: DownloadOptions) -> SupervisorResult<String> {
        validate_download(&mut options)?;
        self.shared.tracker.start_job(&options).await
    }

    /// Advisory; returns whether the job was being tracked.
    pub fn cancel_download(&self, job_id: &str) -> bool {
        self.shared.tracker.cancel(job_id)
    }

    /// Current worker record for one job.
    pub async fn job_status(&self, job_id: &str) -> SupervisorResult<JobRecord> {
        self.shared.client.job_progress(job_id).await
    }
}

impl Shared {
    /// Apply a legal transition. Callers hold the control mutex.
    fn set_state(&self, next: LifecycleState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition(&next) {
                log::warn!("Ignoring illegal worker transition {current} -> {next}");
                return false;
            }
            log::info!("Worker state: {current} -> {next}");
            *current = next;
            true
        })
    }

    fn current_state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// One launch attempt: port, spawn, readiness.
    async fn launch_once(&self) -> SupervisorResult<WorkerHandle> {
        let port = allocate_port()?;
        let handle = self.spawner.spawn(port, self.diagnostics.clone()).await?;

        {
            let mut ctl = self.control.lock().await;
            if !ctl.auto_restart {
                handle.kill();
                return Err(SupervisorError::ShuttingDown);
            }
            ctl.worker = Some(handle.clone());
        }

        match self.prober.wait_ready(&handle, &self.diagnostics).await {
            Ok(_) => {
                let mut ctl = self.control.lock().await;
                if !ctl.auto_restart {
                    return Err(SupervisorError::ShuttingDown);
                }
                ctl.restart.reset();
                ctl.last_error = None;
                self.set_state(LifecycleState::Ready { port });
                self.events.status(StatusEvent::Ready { port });
                Ok(handle)
            }
            Err(e) => {
                if !handle.has_exited() {
                    handle.kill();
                    let _ = tokio::time::timeout(STARTUP_KILL_GRACE, handle.wait()).await;
                }
                let mut ctl = self.control.lock().await;
                if ctl.auto_restart {
                    ctl.worker = None;
                }
                Err(e)
            }
        }
    }

    /// Handle the exit of a worker that had been ready.
    ///
    /// Returns the failure to feed the restart policy, or `None` if nothing
    /// should be restarted.
    async fn on_worker_exit(&self, exit: WorkerExit) -> Option<SupervisorError> {
        let mut ctl = self.control.lock().await;
        if !ctl.auto_restart {
            return None;
        }
        ctl.worker = None;

        let err = SupervisorError::WorkerExited {
            code: exit.code,
            last_error: self.diagnostics.last_error_line().or(exit.error.clone()),
        };
        let reason = err.to_string();
        self.tracker.fail_all(&reason);

        if exit.is_crash() {
            log::error!("{reason}");
            self.set_state(LifecycleState::Crashed);
            self.events.status(StatusEvent::NotReady { reason });
            Some(err)
        } else {
            log::warn!("Worker exited without an error code ({reason}); not restarting");
            ctl.last_error = Some(err);
            self.set_state(LifecycleState::Idle);
            self.events.status(StatusEvent::NotReady { reason });
            None
        }
    }

    /// Decide what follows a failed start or a crash. `Some(delay)` means retry.
    async fn on_failure(&self, err: SupervisorError) -> Option<Duration> {
        let mut ctl = self.control.lock().await;
        if !ctl.auto_restart {
            return None;
        }

        let tail = self.diagnostics.tail(5);
        if !tail.is_empty() {
            log::warn!("Worker failure: {err}\nlast worker output:\n{}", tail.join("\n"));
        } else {
            log::warn!("Worker failure: {err}");
        }

        if err.is_fatal() {
            log::error!("Not retrying: {err}");
            self.settle_failed(&mut ctl, err);
            return None;
        }

        if self.current_state() == LifecycleState::Starting {
            self.set_state(LifecycleState::Crashed);
        }

        match ctl.restart.record_failure() {
            RestartDecision::Retry { attempt, delay } => {
                log::info!(
                    "Restarting worker in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    ctl.restart.max_retries()
                );
                self.events.status(StatusEvent::Restarting {
                    attempt,
                    max_attempts: ctl.restart.max_retries(),
                    delay_ms: delay.as_millis() as u64,
                    reason: err.to_string(),
                });
                ctl.last_error = Some(err);
                Some(delay)
            }
            RestartDecision::GiveUp { failures } => {
                let mut last_error = err.to_string();
                if let Some(line) = self.diagnostics.last_error_line() {
                    if !last_error.contains(&line) {
                        last_error = format!("{last_error}: {line}");
                    }
                }
                ctl.given_up = true;
                self.settle_failed(
                    &mut ctl,
                    SupervisorError::RestartsExhausted {
                        failures,
                        last_error,
                    },
                );
                None
            }
        }
    }

    fn settle_failed(&self, ctl: &mut Control, err: SupervisorError) {
        log::error!("Worker failed: {err}");
        self.set_state(LifecycleState::Idle);
        self.events.status(StatusEvent::Failed {
            error_code: err.error_code(),
            message: err.to_string(),
        });
        ctl.last_error = Some(err);
    }
}

/// Control loop for one `start()`: launch, watch, restart.
async fn supervise(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();

    loop {
        let failure = match shared.launch_once().await {
            Ok(handle) => {
                let exit = handle.wait().await;
                match shared.on_worker_exit(exit).await {
                    Some(err) => err,
                    None => return,
                }
            }
            Err(SupervisorError::ShuttingDown) => return,
            Err(err) => err,
        };

        let Some(delay) = shared.on_failure(failure).await else {
            return;
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.wait_for(|stopping| *stopping) => return,
        }

        let ctl = shared.control.lock().await;
        if !ctl.auto_restart {
            return;
        }
        shared.set_state(LifecycleState::Starting);
        shared.events.status(StatusEvent::Starting);
    }
}
