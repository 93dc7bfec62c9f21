use std::path::PathBuf;

use thiserror::Error;

use crate::events::ErrorCode;

/// Everything that can go wrong while supervising the worker.
///
/// The enum is `Clone` so a single startup failure can be handed to every
/// caller that joined the same `start()` attempt.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("failed to allocate a local port: {0}")]
    PortAllocation(String),

    #[error("worker executable not found at {}", .path.display())]
    ExecutableNotFound { path: PathBuf },

    #[error(
        "worker executable at {} looks truncated ({size} bytes, expected at least {min_size}); reinstall the application",
        .path.display()
    )]
    CorruptExecutable {
        path: PathBuf,
        size: u64,
        min_size: u64,
    },

    #[error("failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("failed to set up the worker HTTP client: {0}")]
    HttpClient(String),

    #[error("worker exited during startup (code {}){}", display_code(.code), display_detail(.last_error))]
    WorkerTerminatedDuringStartup {
        code: Option<i32>,
        last_error: Option<String>,
    },

    #[error("worker did not become ready after {attempts} health checks")]
    ReadinessTimeout { attempts: u32 },

    #[error("worker exited unexpectedly (code {}){}", display_code(.code), display_detail(.last_error))]
    WorkerExited {
        code: Option<i32>,
        last_error: Option<String>,
    },

    #[error("worker failed {failures} times in a row, giving up: {last_error}")]
    RestartsExhausted { failures: u32, last_error: String },

    #[error("worker is not ready; wait for the ready status event and retry")]
    NotReady,

    #[error("{message}")]
    WorkerRequest { status: Option<u16>, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl SupervisorError {
    /// Fatal errors mean the host environment is broken; retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::PortAllocation(_)
                | SupervisorError::ExecutableNotFound { .. }
                | SupervisorError::CorruptExecutable { .. }
                | SupervisorError::Spawn(_)
                | SupervisorError::HttpClient(_)
        )
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            SupervisorError::PortAllocation(_) => ErrorCode::PortUnavailable,
            SupervisorError::ExecutableNotFound { .. } => ErrorCode::ExecutableMissing,
            SupervisorError::CorruptExecutable { .. } => ErrorCode::ExecutableCorrupt,
            SupervisorError::Spawn(_) => ErrorCode::SpawnFailed,
            SupervisorError::HttpClient(_) => ErrorCode::RequestFailed,
            SupervisorError::WorkerTerminatedDuringStartup { .. } => ErrorCode::WorkerExited,
            SupervisorError::ReadinessTimeout { .. } => ErrorCode::ReadinessTimeout,
            SupervisorError::WorkerExited { .. } => ErrorCode::WorkerExited,
            SupervisorError::RestartsExhausted { .. } => ErrorCode::RestartsExhausted,
            SupervisorError::NotReady => ErrorCode::NotReady,
            SupervisorError::WorkerRequest { .. } => ErrorCode::RequestFailed,
            SupervisorError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SupervisorError::ShuttingDown => ErrorCode::ShuttingDown,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn display_detail(detail: &Option<String>) -> String {
    match detail {
        Some(line) if !line.is_empty() => format!(": {line}"),
        _ => String::new(),
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SupervisorError::PortAllocation("no sockets".into()).is_fatal());
        assert!(SupervisorError::ExecutableNotFound {
            path: PathBuf::from("/missing")
        }
        .is_fatal());
        assert!(SupervisorError::HttpClient("no TLS backend".into()).is_fatal());
        assert!(!SupervisorError::ReadinessTimeout { attempts: 60 }.is_fatal());
        assert!(!SupervisorError::WorkerTerminatedDuringStartup {
            code: Some(1),
            last_error: None
        }
        .is_fatal());
    }

    #[test]
    fn test_startup_message_includes_last_line() {
        let err = SupervisorError::WorkerTerminatedDuringStartup {
            code: Some(1),
            last_error: Some("ModuleNotFoundError: No module named 'flask'".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("code 1"));
        assert!(msg.contains("No module named 'flask'"));
    }

    #[test]
    fn test_request_error_is_verbatim() {
        let err = SupervisorError::WorkerRequest {
            status: Some(400),
            message: "Invalid YouTube URL".into(),
        };
        assert_eq!(err.to_string(), "Invalid YouTube URL");
    }
}
