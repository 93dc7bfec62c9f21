//! Supervisor Configuration
//!
//! All tunables for launching, probing, restarting and stopping the worker.
//! Stored as JSON; every field has a default so partial files are valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// File name looked up in the per-user config directory.
pub const CONFIG_FILE_NAME: &str = "supervisor.json";

/// How the worker is shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Python sources next to the project, run through an interpreter.
    #[default]
    Dev,
    /// Self-contained backend executable bundled with the application.
    Packaged,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub run_mode: RunMode,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub readiness: ReadinessSettings,

    #[serde(default)]
    pub restart: RestartSettings,

    #[serde(default)]
    pub jobs: JobSettings,

    #[serde(default)]
    pub requests: RequestSettings,

    #[serde(default)]
    pub shutdown: ShutdownSettings,

    /// Lines of worker output kept for error reports.
    #[serde(default = "default_diagnostics_capacity")]
    pub diagnostics_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::default(),
            worker: WorkerSettings::default(),
            readiness: ReadinessSettings::default(),
            restart: RestartSettings::default(),
            jobs: JobSettings::default(),
            requests: RequestSettings::default(),
            shutdown: ShutdownSettings::default(),
            diagnostics_capacity: default_diagnostics_capacity(),
        }
    }
}

/// Where the worker lives and how it is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Dev mode: directory holding `server.py` and its `venv`.
    #[serde(default = "default_backend_dir")]
    pub backend_dir: PathBuf,

    /// Dev mode: entry script inside `backend_dir`.
    #[serde(default = "default_script_name")]
    pub script_name: String,

    /// Packaged mode: resources directory. Derived from the host executable when unset.
    #[serde(default)]
    pub resources_dir: Option<PathBuf>,

    /// Packaged mode: backend executable name, without platform extension.
    #[serde(default = "default_executable_name")]
    pub executable_name: String,

    /// Packaged mode: anything smaller is treated as a truncated install.
    #[serde(default = "default_min_packaged_size")]
    pub min_packaged_size_bytes: u64,

    /// Appended after `--port <n>`.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            backend_dir: default_backend_dir(),
            script_name: default_script_name(),
            resources_dir: None,
            executable_name: default_executable_name(),
            min_packaged_size_bytes: default_min_packaged_size(),
            extra_args: Vec::new(),
        }
    }
}

/// Health polling after spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessSettings {
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_probe_attempts")]
    pub attempts: u32,

    /// Per-request timeout for a single health check.
    #[serde(default = "default_probe_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_probe_interval_ms(),
            attempts: default_probe_attempts(),
            request_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ReadinessSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.min(1000))
    }
}

/// Capped exponential backoff for unexpected exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSettings {
    #[serde(default = "default_restart_base_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_restart_cap_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_restart_base_ms(),
            max_delay_ms: default_restart_cap_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Job reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl JobSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Host-initiated worker calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSettings {
    /// Metadata extraction can take a while for long videos.
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RequestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Orderly shutdown budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    /// Kill outright if the worker ignores the termination request this long.
    #[serde(default = "default_force_kill_ms")]
    pub force_kill_after_ms: u64,

    /// `stop()` never takes longer than this.
    #[serde(default = "default_overall_shutdown_ms")]
    pub overall_timeout_ms: u64,

    /// Share of the budget spent cancelling outstanding jobs before termination.
    #[serde(default = "default_shutdown_cancel_ms")]
    pub cancel_timeout_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            force_kill_after_ms: default_force_kill_ms(),
            overall_timeout_ms: default_overall_shutdown_ms(),
            cancel_timeout_ms: default_shutdown_cancel_ms(),
        }
    }
}

impl ShutdownSettings {
    pub fn force_kill_after(&self) -> Duration {
        Duration::from_millis(self.force_kill_after_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

// Default value functions
fn default_diagnostics_capacity() -> usize {
    100
}

fn default_backend_dir() -> PathBuf {
    PathBuf::from("python")
}

fn default_script_name() -> String {
    "server.py".to_string()
}

fn default_executable_name() -> String {
    "yt-helper-backend".to_string()
}

fn default_min_packaged_size() -> u64 {
    10 * 1024 * 1024
}

fn default_probe_interval_ms() -> u64 {
    500
}

fn default_probe_attempts() -> u32 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_restart_base_ms() -> u64 {
    2000
}

fn default_restart_cap_ms() -> u64 {
    16000
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_force_kill_ms() -> u64 {
    3000
}

fn default_overall_shutdown_ms() -> u64 {
    5000
}

fn default_shutdown_cancel_ms() -> u64 {
    1000
}

/// Per-user directories for the application.
///
/// macOS:  ~/Library/Application Support/YouTube Helper
/// Windows: %APPDATA%\\YouTube Helper
/// Linux:  ~/.config/youtube-helper (depending on XDG)
pub fn app_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "ythelper", "YouTube Helper")
        .ok_or_else(|| anyhow!("failed to resolve per-user config directory"))
}

/// Default location of the config file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(app_project_dirs()?.config_dir().join(CONFIG_FILE_NAME))
}

impl SupervisorConfig {
    /// Load from `path`, or from the per-user config file when `path` is `None`.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        if !path.exists() {
            log::info!(
                "No supervisor config at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config: {}", path.display()))?;

        log::info!("Loaded supervisor config from {}", path.display());
        Ok(config)
    }

    /// Persist as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json).with_context(|| format!("write config: {}", path.display()))?;
        Ok(())
    }
}

/// Builder for SupervisorConfig.
pub struct SupervisorConfigBuilder {
    config: SupervisorConfig,
}

impl SupervisorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SupervisorConfig::default(),
        }
    }

    pub fn run_mode(mut self, mode: RunMode) -> Self {
        self.config.run_mode = mode;
        self
    }

    pub fn backend_dir(mut self, path: PathBuf) -> Self {
        self.config.worker.backend_dir = path;
        self
    }

    pub fn resources_dir(mut self, path: PathBuf) -> Self {
        self.config.worker.resources_dir = Some(path);
        self
    }

    pub fn min_packaged_size(mut self, bytes: u64) -> Self {
        self.config.worker.min_packaged_size_bytes = bytes;
        self
    }

    pub fn readiness(mut self, interval: Duration, attempts: u32) -> Self {
        self.config.readiness.interval_ms = interval.as_millis() as u64;
        self.config.readiness.attempts = attempts;
        self
    }

    pub fn restart(mut self, base: Duration, cap: Duration, max_retries: u32) -> Self {
        self.config.restart.base_delay_ms = base.as_millis() as u64;
        self.config.restart.max_delay_ms = cap.as_millis() as u64;
        self.config.restart.max_retries = max_retries;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.jobs.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn shutdown(mut self, force_kill_after: Duration, overall: Duration) -> Self {
        self.config.shutdown.force_kill_after_ms = force_kill_after.as_millis() as u64;
        self.config.shutdown.overall_timeout_ms = overall.as_millis() as u64;
        self
    }

    pub fn diagnostics_capacity(mut self, lines: usize) -> Self {
        self.config.diagnostics_capacity = lines;
        self
    }

    pub fn build(self) -> SupervisorConfig {
        self.config
    }
}

impl Default for SupervisorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
