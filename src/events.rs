use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::{JobRecord, JobStatus};

/// Stable error codes to allow UX mapping on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PortUnavailable,
    ExecutableMissing,
    ExecutableCorrupt,
    SpawnFailed,
    WorkerExited,
    ReadinessTimeout,
    RestartsExhausted,
    NotReady,
    RequestFailed,
    InvalidRequest,
    ShuttingDown,
}

/// Worker availability as reported to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    Starting,
    Ready {
        port: u16,
    },
    NotReady {
        reason: String,
    },
    /// Interim notice; the supervisor is about to relaunch the worker.
    Restarting {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        reason: String,
    },
    /// Terminal: the worker stays down until the application restarts.
    Failed {
        error_code: ErrorCode,
        message: String,
    },
    Stopped,
}

/// Supervisor -> host events. The host subscribes once and switches on `event`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Status(StatusEvent),
    Progress(JobRecord),
    Complete(JobRecord),
    Error(JobRecord),
    Cancelled(JobRecord),
}

impl SupervisorEvent {
    /// Map a worker record to the event the host should see for it.
    pub fn for_record(record: JobRecord) -> Self {
        match record.status {
            JobStatus::Complete => SupervisorEvent::Complete(record),
            JobStatus::Error => SupervisorEvent::Error(record),
            JobStatus::Cancelled => SupervisorEvent::Cancelled(record),
            JobStatus::Pending | JobStatus::Running | JobStatus::Processing => {
                SupervisorEvent::Progress(record)
            }
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            SupervisorEvent::Status(_) => None,
            SupervisorEvent::Progress(r)
            | SupervisorEvent::Complete(r)
            | SupervisorEvent::Error(r)
            | SupervisorEvent::Cancelled(r) => Some(&r.job_id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorEvent::Complete(_) | SupervisorEvent::Error(_) | SupervisorEvent::Cancelled(_)
        )
    }
}

/// Receiving half handed to the host by `Supervisor::new`.
pub type EventStream = mpsc::UnboundedReceiver<SupervisorEvent>;

/// Sending half shared by every supervisor task.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: SupervisorEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("event dropped: host stopped listening");
        }
    }

    pub fn status(&self, status: StatusEvent) {
        self.emit(SupervisorEvent::Status(status));
    }
}
