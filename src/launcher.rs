//! Worker Process Launcher
//!
//! Resolves the worker command for the current run mode, spawns it with its
//! output captured into the diagnostic ring, and hands back a [`WorkerHandle`].
//! The `Child` itself is owned by a single reaper task; everything else talks
//! to it through the handle.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{RunMode, SupervisorConfig, WorkerSettings};
use crate::diagnostics::{DiagnosticLog, Stream};
use crate::error::{SupervisorError, SupervisorResult};

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// How long the reaper waits for the output readers to drain after exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Requests the reaper task forwards to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Graceful: SIGTERM on unix, hard kill elsewhere.
    Terminate,
    Kill,
}

/// How the worker ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when killed by a signal or the status could not be read.
    pub code: Option<i32>,
    /// Set when waiting on the process itself failed.
    pub error: Option<String>,
}

impl WorkerExit {
    /// Only a real nonzero exit code counts as a crash.
    pub fn is_crash(&self) -> bool {
        matches!(self.code, Some(c) if c != 0)
    }
}

/// Cloneable view of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pid: Option<u32>,
    port: u16,
    signals: mpsc::UnboundedSender<ProcessSignal>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerHandle {
    /// `exit` must be set to `Some` exactly once, when the process is gone.
    pub fn new(
        pid: Option<u32>,
        port: u16,
        signals: mpsc::UnboundedSender<ProcessSignal>,
        exit: watch::Receiver<Option<WorkerExit>>,
    ) -> Self {
        Self {
            pid,
            port,
            signals,
            exit,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Non-blocking check.
    pub fn exit_status(&self) -> Option<WorkerExit> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolve once the process has exited.
    pub async fn wait(&self) -> WorkerExit {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_default(),
            Err(_) => WorkerExit {
                code: None,
                error: Some("worker reaper went away".to_string()),
            },
        };
        exit
    }

    /// Returns false if the process is already gone.
    pub fn terminate(&self) -> bool {
        self.signals.send(ProcessSignal::Terminate).is_ok()
    }

    pub fn kill(&self) -> bool {
        self.signals.send(ProcessSignal::Kill).is_ok()
    }
}

/// Starts a worker bound to `port`.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, port: u16, diagnostics: DiagnosticLog) -> SupervisorResult<WorkerHandle>;
}

/// Fully resolved command line and environment.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, OsString)>,
}

/// Production spawner: the Python backend, from sources or as a bundled executable.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    mode: RunMode,
    worker: WorkerSettings,
}

impl ProcessLauncher {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            mode: config.run_mode,
            worker: config.worker.clone(),
        }
    }

    /// Resolve program, arguments and environment for `port`.
    pub fn resolve(&self, port: u16) -> SupervisorResult<LaunchSpec> {
        let (program, mut args, current_dir) = match self.mode {
            RunMode::Dev => self.resolve_dev()?,
            RunMode::Packaged => self.resolve_packaged()?,
        };

        args.push("--port".to_string());
        args.push(port.to_string());
        args.extend(self.worker.extra_args.iter().cloned());

        let mut env = Vec::new();
        if self.mode == RunMode::Dev {
            env.push(("PYTHONUNBUFFERED".to_string(), OsString::from("1")));
        }

        match self.find_ffmpeg_dir() {
            Some(dir) => {
                log::info!("Using bundled ffmpeg from {:?}", dir);
                let mut paths = vec![dir];
                if let Some(existing) = std::env::var_os("PATH") {
                    paths.extend(std::env::split_paths(&existing));
                }
                match std::env::join_paths(paths) {
                    Ok(joined) => env.push(("PATH".to_string(), joined)),
                    Err(e) => log::warn!("Could not extend worker PATH: {}", e),
                }
            }
            None => {
                log::warn!("Bundled ffmpeg not found; worker will rely on the system PATH");
            }
        }

        Ok(LaunchSpec {
            program,
            args,
            current_dir,
            env,
        })
    }

    fn resolve_dev(&self) -> SupervisorResult<(PathBuf, Vec<String>, Option<PathBuf>)> {
        let backend_dir = &self.worker.backend_dir;
        let script = backend_dir.join(&self.worker.script_name);
        if !script.exists() {
            return Err(SupervisorError::ExecutableNotFound { path: script });
        }

        let venv_python = venv_interpreter(backend_dir);
        let interpreter = if venv_python.exists() {
            venv_python
        } else {
            match which::which("python3").or_else(|_| which::which("python")) {
                Ok(system) => {
                    log::warn!(
                        "No virtualenv interpreter at {:?}, falling back to system {:?}",
                        venv_python,
                        system
                    );
                    system
                }
                Err(_) => {
                    return Err(SupervisorError::ExecutableNotFound { path: venv_python });
                }
            }
        };

        let args = vec![self.worker.script_name.clone()];
        Ok((interpreter, args, Some(backend_dir.clone())))
    }

    fn resolve_packaged(&self) -> SupervisorResult<(PathBuf, Vec<String>, Option<PathBuf>)> {
        let binary = binary_name(&self.worker.executable_name);
        let bundled = self
            .resources_dir()
            .map(|dir| dir.join("backend").join(&binary));

        let path = match bundled {
            Some(path) if path.exists() => path,
            other => match which::which(&binary) {
                Ok(system) => {
                    log::warn!(
                        "Bundled backend missing at {:?}, falling back to {:?}",
                        other,
                        system
                    );
                    system
                }
                Err(_) => {
                    return Err(SupervisorError::ExecutableNotFound {
                        path: other.unwrap_or_else(|| PathBuf::from(binary)),
                    });
                }
            },
        };

        check_executable_size(&path, self.worker.min_packaged_size_bytes)?;

        let current_dir = path.parent().map(Path::to_path_buf);
        Ok((path, Vec::new(), current_dir))
    }

    /// Configured resources directory, else derived from the host executable.
    fn resources_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.worker.resources_dir {
            return Some(dir.clone());
        }

        let exe_dir = host_exe_dir()?;
        // In a macOS .app bundle the binary sits in Contents/MacOS/.
        let mac_resources = exe_dir.join("..").join("Resources");
        if mac_resources.is_dir() {
            return Some(mac_resources);
        }
        Some(exe_dir)
    }

    fn find_ffmpeg_dir(&self) -> Option<PathBuf> {
        let mut candidates = Vec::new();
        match self.mode {
            RunMode::Packaged => {
                if let Some(resources) = self.resources_dir() {
                    candidates.push(resources.join("ffmpeg"));
                }
            }
            RunMode::Dev => {
                candidates.push(self.worker.backend_dir.join("ffmpeg"));
                candidates.push(self.worker.backend_dir.join("..").join("ffmpeg"));
            }
        }
        if let Some(exe_dir) = host_exe_dir() {
            candidates.push(exe_dir.join("ffmpeg"));
            candidates.push(exe_dir.join("..").join("ffmpeg"));
        }

        candidates
            .into_iter()
            .find(|dir| dir.join(binary_name("ffmpeg")).exists())
    }
}

#[async_trait]
impl Spawner for ProcessLauncher {
    async fn spawn(&self, port: u16, diagnostics: DiagnosticLog) -> SupervisorResult<WorkerHandle> {
        let spec = self.resolve(port)?;
        spawn_worker(&spec, port, diagnostics)
    }
}

fn host_exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn venv_interpreter(backend_dir: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        backend_dir.join("venv").join("Scripts").join("python.exe")
    }
    #[cfg(not(windows))]
    {
        backend_dir.join("venv").join("bin").join("python")
    }
}

fn binary_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

/// A bundled backend below `min_size` is a truncated or partial install.
fn check_executable_size(path: &Path, min_size: u64) -> SupervisorResult<()> {
    let size = std::fs::metadata(path)
        .map_err(|_| SupervisorError::ExecutableNotFound {
            path: path.to_path_buf(),
        })?
        .len();
    if size < min_size {
        return Err(SupervisorError::CorruptExecutable {
            path: path.to_path_buf(),
            size,
            min_size,
        });
    }
    Ok(())
}

/// Spawn `spec` and start the output readers and the reaper task.
pub fn spawn_worker(
    spec: &LaunchSpec,
    port: u16,
    diagnostics: DiagnosticLog,
) -> SupervisorResult<WorkerHandle> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    // Hide console window on Windows
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let mut child = cmd.spawn().map_err(|e| {
        SupervisorError::Spawn(format!("{}: {}", spec.program.display(), e))
    })?;
    let pid = child.id();
    log::info!(
        "Spawned worker {:?} (pid {:?}) on port {}",
        spec.program,
        pid,
        port
    );

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, diagnostics.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, diagnostics));
    }

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(reap(child, pid, signal_rx, exit_tx, readers));

    Ok(WorkerHandle::new(pid, port, signal_tx, exit_rx))
}

fn spawn_reader<R>(pipe: R, stream: Stream, diagnostics: DiagnosticLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::debug!("[worker {}] {}", stream, line);
            diagnostics.push(&line, stream);
        }
    })
}

/// Owns the child until it exits, forwarding termination requests.
async fn reap(
    mut child: Child,
    pid: Option<u32>,
    mut signals: mpsc::UnboundedReceiver<ProcessSignal>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    readers: Vec<JoinHandle<()>>,
) {
    let mut handles_alive = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = signals.recv(), if handles_alive => match signal {
                Some(signal) => deliver(&mut child, pid, signal),
                None => {
                    // Every handle was dropped; nobody can stop the worker anymore.
                    handles_alive = false;
                    log::warn!("Worker handle dropped while process still running, killing it");
                    deliver(&mut child, pid, ProcessSignal::Kill);
                }
            },
        }
    };

    // Let the readers flush the last lines so exit errors can quote them.
    for reader in readers {
        let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
    }

    let exit = match status {
        Ok(status) => WorkerExit {
            code: status.code(),
            error: None,
        },
        Err(e) => WorkerExit {
            code: None,
            error: Some(e.to_string()),
        },
    };
    log::info!("Worker (pid {:?}) exited with code {:?}", pid, exit.code);
    let _ = exit_tx.send(Some(exit));
}

fn deliver(child: &mut Child, pid: Option<u32>, signal: ProcessSignal) {
    match signal {
        ProcessSignal::Terminate => {
            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    use nix::sys::signal::{kill, Signal};
                    use nix::unistd::Pid;

                    log::debug!("Sending SIGTERM to worker pid {}", pid);
                    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        Ok(()) => return,
                        Err(e) => log::warn!("SIGTERM to worker pid {} failed: {}", pid, e),
                    }
                }
            }
            #[cfg(not(unix))]
            let _ = pid;

            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill worker: {}", e);
            }
        }
        ProcessSignal::Kill => {
            log::debug!("Killing worker pid {:?}", pid);
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill worker: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfigBuilder;

    #[test]
    fn test_worker_exit_crash_classification() {
        assert!(WorkerExit {
            code: Some(1),
            error: None
        }
        .is_crash());
        assert!(!WorkerExit {
            code: Some(0),
            error: None
        }
        .is_crash());
        // Killed by a signal.
        assert!(!WorkerExit::default().is_crash());
    }

    #[test]
    fn test_packaged_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SupervisorConfigBuilder::new()
            .run_mode(RunMode::Packaged)
            .resources_dir(dir.path().to_path_buf())
            .build();
        config.worker.executable_name = "definitely-not-a-real-backend-4f2a".into();

        let err = ProcessLauncher::new(&config).resolve(5000).unwrap_err();
        assert!(matches!(err, SupervisorError::ExecutableNotFound { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_packaged_truncated_executable() {
        let dir = tempfile::tempdir().unwrap();
        let backend_dir = dir.path().join("backend");
        std::fs::create_dir_all(&backend_dir).unwrap();
        std::fs::write(backend_dir.join(binary_name("yt-helper-backend")), b"partial").unwrap();

        let config = SupervisorConfigBuilder::new()
            .run_mode(RunMode::Packaged)
            .resources_dir(dir.path().to_path_buf())
            .build();

        match ProcessLauncher::new(&config).resolve(5000) {
            Err(SupervisorError::CorruptExecutable { size, min_size, .. }) => {
                assert_eq!(size, 7);
                assert_eq!(min_size, 10 * 1024 * 1024);
            }
            other => panic!("expected CorruptExecutable, got {other:?}"),
        }
    }

    #[test]
    fn test_packaged_resolves_port_and_ffmpeg_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend_dir = dir.path().join("backend");
        let ffmpeg_dir = dir.path().join("ffmpeg");
        std::fs::create_dir_all(&backend_dir).unwrap();
        std::fs::create_dir_all(&ffmpeg_dir).unwrap();
        std::fs::write(backend_dir.join(binary_name("yt-helper-backend")), vec![0u8; 64]).unwrap();
        std::fs::write(ffmpeg_dir.join(binary_name("ffmpeg")), b"").unwrap();

        let config = SupervisorConfigBuilder::new()
            .run_mode(RunMode::Packaged)
            .resources_dir(dir.path().to_path_buf())
            .min_packaged_size(16)
            .build();

        let spec = ProcessLauncher::new(&config).resolve(51234).unwrap();
        assert_eq!(spec.args, vec!["--port", "51234"]);
        assert_eq!(spec.current_dir.as_deref(), Some(backend_dir.as_path()));

        let path = spec
            .env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .unwrap();
        let first = std::env::split_paths(&path).next().unwrap();
        assert_eq!(first, ffmpeg_dir);
    }

    #[test]
    fn test_dev_missing_script() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfigBuilder::new()
            .backend_dir(dir.path().to_path_buf())
            .build();

        let err = ProcessLauncher::new(&config).resolve(5000).unwrap_err();
        match err {
            SupervisorError::ExecutableNotFound { path } => {
                assert!(path.ends_with("server.py"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_captures_output_and_exit_code() {
        let spec = LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".into(),
                "echo 'Starting server'; echo 'boom: bad config' >&2; exit 3".into(),
            ],
            current_dir: None,
            env: Vec::new(),
        };
        let diagnostics = DiagnosticLog::new(10);

        let handle = spawn_worker(&spec, 5000, diagnostics.clone()).unwrap();
        let exit = handle.wait().await;

        assert_eq!(exit.code, Some(3));
        assert!(exit.is_crash());
        assert!(handle.has_exited());
        assert_eq!(
            diagnostics.last_error_line().as_deref(),
            Some("boom: bad config")
        );
        assert!(diagnostics
            .tail(10)
            .iter()
            .any(|line| line == "Starting server"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_worker() {
        let spec = LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "exec sleep 30".into()],
            current_dir: None,
            env: Vec::new(),
        };

        let handle = spawn_worker(&spec, 5000, DiagnosticLog::new(10)).unwrap();
        assert!(handle.pid().is_some());
        assert!(handle.exit_status().is_none());

        assert!(handle.terminate());
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        // Killed by SIGTERM: no exit code, not a crash.
        assert_eq!(exit.code, None);
        assert!(!exit.is_crash());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let spec = LaunchSpec {
            program: PathBuf::from("/nonexistent/yt-helper-backend"),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        };
        let err = spawn_worker(&spec, 5000, DiagnosticLog::new(10)).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
        assert!(err.is_fatal());
    }
}
