//! Sidecar supervisor for the YouTube Helper download worker.
//!
//! The worker is a local HTTP service (Python, from sources in development
//! or as a bundled executable) that does the actual downloading. This crate
//! launches it on a free loopback port, waits for it to answer its health
//! check, restarts it with backoff when it crashes, forwards host requests,
//! tracks download jobs through to a terminal status and shuts it down.
//!
//! ```no_run
//! use yt_helper_supervisor::{DownloadOptions, Supervisor, SupervisorConfig, SupervisorEvent};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (supervisor, mut events) = Supervisor::new(SupervisorConfig::load(None)?)?;
//! supervisor.start().await?;
//!
//! let id = supervisor
//!     .start_download(DownloadOptions::new("https://youtu.be/dQw4w9WgXcQ", "/tmp"))
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     if event.job_id() == Some(id.as_str()) && event.is_terminal() {
//!         break;
//!     }
//! }
//! supervisor.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod launcher;
pub mod models;
pub mod port;
pub mod probe;
pub mod restart;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod tracker;
pub mod transport;
pub mod validate;

pub use config::{RunMode, SupervisorConfig, SupervisorConfigBuilder};
pub use diagnostics::{DiagnosticLine, DiagnosticLog, Stream};
pub use error::{SupervisorError, SupervisorResult};
pub use events::{ErrorCode, EventStream, StatusEvent, SupervisorEvent};
pub use launcher::{ProcessLauncher, ProcessSignal, Spawner, WorkerExit, WorkerHandle};
pub use models::{DownloadMode, DownloadOptions, JobRecord, JobStatus, VideoInfo};
pub use shutdown::ShutdownOutcome;
pub use state::LifecycleState;
pub use supervisor::Supervisor;
pub use transport::{HttpTransport, Method, Transport, TransportError, WorkerRequest, WorkerResponse};
