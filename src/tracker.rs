//! Job Tracker
//!
//! Keeps the host's view of in-flight downloads and reconciles it against the
//! worker's progress listing. Polling runs only while something is tracked
//! (or a cancelled job still needs its worker-side record cleared).
//!
//! Guarantees per job id: progress never goes backwards, and exactly one
//! terminal event (`complete`, `error` or `cancelled`) reaches the host.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::client::RequestClient;
use crate::error::{SupervisorError, SupervisorResult};
use crate::events::{EventSink, SupervisorEvent};
use crate::models::{DownloadOptions, JobRecord, JobStatus};

/// Message attached to jobs that vanished from the worker's listing.
const LOST_JOB_MESSAGE: &str = "job is no longer known to the worker";

#[derive(Debug)]
struct TrackedJob {
    tracked_at: Instant,
    last: JobRecord,
    /// Whether `last` has been forwarded to the host yet.
    forwarded: bool,
}

#[derive(Debug)]
struct TrackerState {
    jobs: HashMap<String, TrackedJob>,
    /// Cancelled on the host side; the worker record is cleared once it turns terminal.
    awaiting_clear: HashMap<String, Instant>,
    accepting: bool,
    polling: bool,
}

struct Inner {
    client: RequestClient,
    events: EventSink,
    poll_interval: Duration,
    state: Mutex<TrackerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Inner>,
}

impl JobTracker {
    pub fn new(client: RequestClient, events: EventSink, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                events,
                poll_interval,
                state: Mutex::new(TrackerState {
                    jobs: HashMap::new(),
                    awaiting_clear: HashMap::new(),
                    accepting: true,
                    polling: false,
                }),
            }),
        }
    }

    /// Start a job on the worker and track the returned id.
    pub async fn start_job(&self, options: &DownloadOptions) -> SupervisorResult<String> {
        if !self.inner.lock().accepting {
            return Err(SupervisorError::ShuttingDown);
        }

        let job_id = self.inner.client.start_download(options).await?;
        match self.track(&job_id) {
            Ok(_) => {
                log::info!("Started job {} for {}", job_id, options.url);
                Ok(job_id)
            }
            Err(e) => {
                // Shutdown won the race; don't leave the job running in the worker.
                let client = self.inner.client.clone();
                let id = job_id.clone();
                tokio::spawn(async move {
                    let _ = client.cancel_download(&id).await;
                });
                Err(e)
            }
        }
    }

    /// Begin tracking `job_id`. Returns false if it was already tracked.
    pub fn track(&self, job_id: &str) -> SupervisorResult<bool> {
        let mut state = self.inner.lock();
        if !state.accepting {
            return Err(SupervisorError::ShuttingDown);
        }
        if state.jobs.contains_key(job_id) {
            return Ok(false);
        }

        state.jobs.insert(
            job_id.to_string(),
            TrackedJob {
                tracked_at: Instant::now(),
                last: JobRecord::new(job_id, JobStatus::Pending),
                forwarded: false,
            },
        );
        self.ensure_polling(&mut state);
        Ok(true)
    }

    /// Advisory cancel. The host sees `cancelled` right away; the worker call
    /// runs in the background and its outcome is ignored.
    ///
    /// Returns whether the job was tracked.
    pub fn cancel(&self, job_id: &str) -> bool {
        let was_tracked = {
            let mut state = self.inner.lock();
            match state.jobs.remove(job_id) {
                Some(job) => {
                    let mut record = job.last;
                    record.status = JobStatus::Cancelled;
                    self.inner.events.emit(SupervisorEvent::Cancelled(record));
                    state
                        .awaiting_clear
                        .insert(job_id.to_string(), Instant::now());
                    self.ensure_polling(&mut state);
                    true
                }
                None => false,
            }
        };

        let client = self.inner.client.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.cancel_download(&id).await {
                log::debug!("Cancel for job {} failed: {}", id, e);
            }
        });

        was_tracked
    }

    /// Apply one progress listing fetched at `requested_at`.
    ///
    /// Returns the ids whose worker-side record should now be cleared.
    pub fn reconcile(&self, records: Vec<JobRecord>, requested_at: Instant) -> Vec<String> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let mut to_clear = Vec::new();
        let mut seen = HashSet::new();

        for mut record in records {
            seen.insert(record.job_id.clone());

            if let Some(job) = state.jobs.get_mut(&record.job_id) {
                if record.progress < job.last.progress {
                    record.progress = job.last.progress;
                }

                if record.is_terminal() {
                    let id = record.job_id.clone();
                    state.jobs.remove(&id);
                    log::info!("Job {} finished: {}", id, record.status.as_str());
                    self.inner.events.emit(SupervisorEvent::for_record(record));
                    to_clear.push(id);
                } else if !job.forwarded || job.last != record {
                    job.last = record.clone();
                    job.forwarded = true;
                    self.inner.events.emit(SupervisorEvent::Progress(record));
                }
            } else if record.is_terminal() && state.awaiting_clear.remove(&record.job_id).is_some()
            {
                to_clear.push(record.job_id);
            }
        }

        let lost: Vec<String> = state
            .jobs
            .iter()
            .filter(|(id, job)| !seen.contains(*id) && job.tracked_at < requested_at)
            .map(|(id, _)| id.clone())
            .collect();
        for id in lost {
            if let Some(job) = state.jobs.remove(&id) {
                log::warn!("Job {} disappeared from the worker", id);
                let mut record = job.last;
                record.status = JobStatus::Error;
                record.error = Some(LOST_JOB_MESSAGE.to_string());
                self.inner.events.emit(SupervisorEvent::Error(record));
            }
        }

        // Nothing left to clear for cancelled jobs the worker already dropped.
        state
            .awaiting_clear
            .retain(|id, since| seen.contains(id) || *since >= requested_at);

        to_clear
    }

    /// The worker went away: every tracked job ends in `error`.
    pub fn fail_all(&self, reason: &str) {
        let mut state = self.inner.lock();
        let mut ids: Vec<String> = state.jobs.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(job) = state.jobs.remove(&id) {
                let mut record = job.last;
                record.status = JobStatus::Error;
                record.error = Some(reason.to_string());
                self.inner.events.emit(SupervisorEvent::Error(record));
            }
        }
        state.awaiting_clear.clear();
    }

    /// Stop accepting jobs and cancel everything still tracked.
    ///
    /// Each tracked job gets one `cancelled` event. Resolves once every cancel
    /// call has returned; callers bound this with their own deadline.
    pub async fn shutdown(&self) {
        let ids = {
            let mut state = self.inner.lock();
            state.accepting = false;
            state.awaiting_clear.clear();

            let mut jobs: Vec<(String, TrackedJob)> = state.jobs.drain().collect();
            jobs.sort_by(|a, b| a.0.cmp(&b.0));
            jobs.into_iter()
                .map(|(id, job)| {
                    let mut record = job.last;
                    record.status = JobStatus::Cancelled;
                    self.inner.events.emit(SupervisorEvent::Cancelled(record));
                    id
                })
                .collect::<Vec<_>>()
        };

        if ids.is_empty() {
            return;
        }
        log::info!("Cancelling {} outstanding job(s)", ids.len());

        let mut calls = JoinSet::new();
        for id in ids {
            let client = self.inner.client.clone();
            calls.spawn(async move {
                if let Err(e) = client.cancel_download(&id).await {
                    log::debug!("Cancel for job {} during shutdown failed: {}", id, e);
                }
            });
        }
        while calls.join_next().await.is_some() {}
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.inner.lock().jobs.contains_key(job_id)
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock().accepting
    }

    fn ensure_polling(&self, state: &mut TrackerState) {
        if state.polling {
            return;
        }
        state.polling = true;
        let tracker = self.clone();
        tokio::spawn(async move { tracker.poll_loop().await });
    }

    async fn poll_loop(self) {
        log::debug!("Job polling started");
        loop {
            tokio::time::sleep(self.inner.poll_interval).await;

            {
                let mut state = self.inner.lock();
                if state.jobs.is_empty() && state.awaiting_clear.is_empty() {
                    state.polling = false;
                    log::debug!("Job polling stopped: nothing tracked");
                    return;
                }
            }

            let requested_at = Instant::now();
            match self.inner.client.list_progress().await {
                Ok(records) => {
                    for id in self.reconcile(records, requested_at) {
                        if let Err(e) = self.inner.client.clear_download(&id).await {
                            log::debug!("Clear for job {} failed: {}", id, e);
                        }
                    }
                }
                Err(SupervisorError::NotReady) => {
                    // Restarting; fail_all() settles the jobs if the worker died.
                }
                Err(e) => {
                    log::warn!("Progress poll failed: {}", e);
                }
            }
        }
    }
}
