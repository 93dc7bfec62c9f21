//! Shared fakes for supervisor integration tests.
//!
//! `FakeSpawner` plays scripted worker lifetimes and `FakeTransport` answers
//! the worker API from the same shared `World`, so a "crashed" worker also
//! stops answering requests. Everything runs on tokio's paused clock.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use yt_helper_supervisor::{
    DiagnosticLog, EventStream, JobRecord, JobStatus, Method, ProcessSignal, Spawner, Stream,
    Supervisor, SupervisorConfig, SupervisorEvent, SupervisorResult, Transport, TransportError,
    WorkerExit, WorkerHandle, WorkerRequest, WorkerResponse,
};

/// How one spawned worker behaves.
#[derive(Debug, Clone)]
pub struct Launch {
    /// Health starts answering this long after spawn; `None` never.
    pub ready_after: Option<Duration>,
    /// Exit on its own with this code after the delay.
    pub crash_after: Option<(Duration, i32)>,
    pub honors_terminate: bool,
    pub honors_kill: bool,
}

impl Launch {
    pub fn stable() -> Self {
        Self {
            ready_after: Some(Duration::ZERO),
            crash_after: None,
            honors_terminate: true,
            honors_kill: true,
        }
    }

    /// Dies with `code` one second in, before ever answering health checks.
    pub fn crash_during_startup(code: i32) -> Self {
        Self {
            ready_after: None,
            crash_after: Some((Duration::from_secs(1), code)),
            ..Self::stable()
        }
    }

    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.ready_after = Some(delay);
        self
    }

    pub fn crash_after(mut self, delay: Duration, code: i32) -> Self {
        self.crash_after = Some((delay, code));
        self
    }

    pub fn ignoring_terminate(mut self) -> Self {
        self.honors_terminate = false;
        self
    }

    pub fn ignoring_kill(mut self) -> Self {
        self.honors_kill = false;
        self
    }
}

#[derive(Debug)]
pub struct WorkerSlot {
    pub alive: bool,
    pub ready_at: Option<Instant>,
    exit_tx: Option<watch::Sender<Option<WorkerExit>>>,
}

/// Request as seen by the fake worker.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Debug, Default)]
pub struct World {
    pub workers: HashMap<u16, WorkerSlot>,
    pub health_calls: u32,
    /// Every non-health request, in order.
    pub requests: Vec<Seen>,
    /// Per job: listing answers, front first. The last one repeats.
    pub jobs: HashMap<String, VecDeque<JobRecord>>,
    /// Scripts handed to the next started jobs.
    pub job_scripts: VecDeque<Vec<JobRecord>>,
    /// Cancel calls are recorded and then never answered.
    pub hang_cancel: bool,
    next_job: u32,
}

pub type SharedWorld = Arc<Mutex<World>>;

pub fn lock(world: &SharedWorld) -> MutexGuard<'_, World> {
    world.lock().unwrap()
}

pub fn new_world() -> SharedWorld {
    Arc::new(Mutex::new(World::default()))
}

pub fn running(progress: f64) -> JobRecord {
    JobRecord::new("", JobStatus::Running).with_progress(progress)
}

pub fn complete() -> JobRecord {
    let mut record = JobRecord::new("", JobStatus::Complete).with_progress(100.0);
    record.filename = Some("video.mp4".to_string());
    record
}

pub struct FakeSpawner {
    world: SharedWorld,
    script: Mutex<VecDeque<Launch>>,
    fallback: Launch,
    spawns: AtomicU32,
}

impl FakeSpawner {
    pub fn new(world: SharedWorld, script: Vec<Launch>) -> Self {
        Self {
            world,
            script: Mutex::new(script.into()),
            fallback: Launch::stable(),
            spawns: AtomicU32::new(0),
        }
    }

    /// Behaviour once the script runs out.
    pub fn with_fallback(mut self, launch: Launch) -> Self {
        self.fallback = launch;
        self
    }

    pub fn spawns(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Spawner for FakeSpawner {
    async fn spawn(&self, port: u16, diagnostics: DiagnosticLog) -> SupervisorResult<WorkerHandle> {
        let n = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;
        let launch = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let now = Instant::now();
        lock(&self.world).workers.insert(
            port,
            WorkerSlot {
                alive: true,
                ready_at: launch.ready_after.map(|d| now + d),
                exit_tx: None,
            },
        );
        diagnostics.push(&format!("Starting server on port {port}"), Stream::Stdout);

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let world = self.world.clone();

        tokio::spawn(async move {
            let crash = async {
                match launch.crash_after {
                    Some((delay, code)) => {
                        tokio::time::sleep(delay).await;
                        code
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(crash);

            let code = loop {
                tokio::select! {
                    code = &mut crash => {
                        diagnostics.push(
                            &format!("RuntimeError: worker {n} crashed"),
                            Stream::Stderr,
                        );
                        break Some(code);
                    }
                    signal = signal_rx.recv() => match signal {
                        Some(ProcessSignal::Terminate) if launch.honors_terminate => break Some(0),
                        Some(ProcessSignal::Kill) if launch.honors_kill => break None,
                        Some(_) => continue,
                        None => break None,
                    },
                }
            };

            let _ = exit_tx.send(Some(WorkerExit { code, error: None }));
            let mut world = world.lock().unwrap();
            if let Some(slot) = world.workers.get_mut(&port) {
                slot.alive = false;
                slot.exit_tx = Some(exit_tx);
            }
        });

        Ok(WorkerHandle::new(Some(10_000 + n), port, signal_tx, exit_rx))
    }
}

pub struct FakeTransport {
    world: SharedWorld,
}

impl FakeTransport {
    pub fn new(world: SharedWorld) -> Self {
        Self { world }
    }
}

fn ok(body: Value) -> Result<WorkerResponse, TransportError> {
    Ok(WorkerResponse::new(200, body))
}

fn not_found(message: &str) -> Result<WorkerResponse, TransportError> {
    Ok(WorkerResponse::new(404, json!({ "error": message })))
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: WorkerRequest) -> Result<WorkerResponse, TransportError> {
        let hang = request.path == "/api/download/cancel" && lock(&self.world).hang_cancel;
        if hang {
            lock(&self.world).requests.push(Seen {
                method: request.method.clone(),
                path: request.path.clone(),
                body: request.body.clone(),
            });
            std::future::pending::<()>().await;
        }

        let mut world = self.world.lock().unwrap();
        let now = Instant::now();

        let ready = match world.workers.get(&request.port) {
            Some(slot) if slot.alive => slot.ready_at.is_some_and(|at| now >= at),
            _ => false,
        };

        if request.path == "/api/health" {
            world.health_calls += 1;
            return if ready {
                ok(json!({ "status": "ok" }))
            } else {
                Err(TransportError::Connect("connection refused".into()))
            };
        }

        world.requests.push(Seen {
            method: request.method.clone(),
            path: request.path.clone(),
            body: request.body.clone(),
        });
        if !ready {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let path = request.path.as_str();
        match (request.method.clone(), path) {
            (Method::POST, "/api/video/info") => ok(json!({
                "id": "abc",
                "title": "Demo video",
                "duration": 212,
                "availableQualities": ["best", "720p"],
            })),
            (Method::POST, "/api/download/start") => {
                world.next_job += 1;
                let id = format!("job-{}", world.next_job);
                let script = world
                    .job_scripts
                    .pop_front()
                    .unwrap_or_else(|| vec![running(0.0)]);
                let script = script
                    .into_iter()
                    .map(|mut r| {
                        r.job_id = id.clone();
                        r
                    })
                    .collect();
                world.jobs.insert(id.clone(), script);
                ok(json!({ "downloadId": id }))
            }
            (Method::GET, "/api/download/progress") => {
                let mut ids: Vec<String> = world.jobs.keys().cloned().collect();
                ids.sort();
                let mut listing = Vec::new();
                for id in ids {
                    if let Some(script) = world.jobs.get_mut(&id) {
                        let record = if script.len() > 1 {
                            script.pop_front()
                        } else {
                            script.front().cloned()
                        };
                        if let Some(record) = record {
                            listing.push(serde_json::to_value(record).unwrap());
                        }
                    }
                }
                ok(Value::Array(listing))
            }
            (Method::POST, "/api/download/cancel") => {
                let id = request
                    .body
                    .as_ref()
                    .and_then(|b| b.get("downloadId"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match world.jobs.get_mut(&id) {
                    Some(script) => {
                        let mut record = JobRecord::new(id.clone(), JobStatus::Cancelled);
                        record.progress = script.front().map(|r| r.progress).unwrap_or(0.0);
                        *script = VecDeque::from(vec![record]);
                        ok(json!({ "success": true }))
                    }
                    None => not_found("Download not found"),
                }
            }
            (Method::DELETE, p) if p.starts_with("/api/download/clear/") => {
                let id = p.trim_start_matches("/api/download/clear/").to_string();
                world.jobs.remove(&id);
                ok(json!({ "success": true }))
            }
            (Method::GET, p) if p.starts_with("/api/download/progress/") => {
                let id = p.trim_start_matches("/api/download/progress/");
                match world.jobs.get(id).and_then(|s| s.front().cloned()) {
                    Some(record) => ok(serde_json::to_value(record).unwrap()),
                    None => not_found("Download not found"),
                }
            }
            _ => not_found("Not Found"),
        }
    }
}

/// Supervisor wired to fakes sharing one world.
pub struct Harness {
    pub supervisor: Supervisor,
    pub events: EventStream,
    pub spawner: Arc<FakeSpawner>,
    pub world: SharedWorld,
}

impl Harness {
    pub fn new(script: Vec<Launch>) -> Self {
        Self::with_spawner(|world| FakeSpawner::new(world, script))
    }

    pub fn with_spawner(build: impl FnOnce(SharedWorld) -> FakeSpawner) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let world = new_world();
        let spawner = Arc::new(build(world.clone()));
        let transport = Arc::new(FakeTransport::new(world.clone()));
        let (supervisor, events) =
            Supervisor::with_parts(SupervisorConfig::default(), spawner.clone(), transport);
        Self {
            supervisor,
            events,
            spawner,
            world,
        }
    }

    /// Next event, failing the test instead of hanging.
    pub async fn next_event(&mut self) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(300), self.events.recv())
            .await
            .expect("timed out waiting for a supervisor event")
            .expect("event stream closed")
    }

    /// Collect events up to and including the first one matching `done`.
    pub async fn events_until(
        &mut self,
        done: impl Fn(&SupervisorEvent) -> bool,
    ) -> Vec<SupervisorEvent> {
        let mut out = Vec::new();
        loop {
            let event = self.next_event().await;
            let finished = done(&event);
            out.push(event);
            if finished {
                return out;
            }
        }
    }

    /// Whatever is queued right now.
    pub fn drain(&mut self) -> Vec<SupervisorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn requests_to(&self, path_prefix: &str) -> Vec<Seen> {
        lock(&self.world)
            .requests
            .iter()
            .filter(|r| r.path.starts_with(path_prefix))
            .cloned()
            .collect()
    }
}
