//! Ownership of one backend child process and its standard streams.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, watch};

use crate::locate::{augmented_path, resolve_binary};

/// Environment variables passed through from the host to every backend.
/// Everything else, agent sockets and credentials included, is dropped unless
/// named in [`ProcessConfig::inherit_env`].
pub const INHERITED_ENV_VARS: &[&str] = &[
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
];

#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Backend home override, e.g. `("CODEX_HOME", "/path")`.
    pub home: Option<(String, PathBuf)>,
    /// Extra host variable names to pass through.
    pub inherit_env: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("backend binary not found: {program}")]
    BinaryNotFound { program: String },
    #[error("permission denied launching {program}")]
    PermissionDenied { program: String },
    #[error("working directory is not usable: {}", path.display())]
    WorkingDirInvalid { path: PathBuf },
    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} started without a piped {stream}")]
    PipeMissing {
        program: String,
        stream: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("backend process has exited")]
    ProcessExited,
    #[error("backend stdin write failed: {0}")]
    Io(#[source] io::Error),
}

/// How the child process ended. Observed exactly once by the monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExitReason {
    /// Exited on its own with a status code.
    Exited { code: i32 },
    /// Died from a signal the host did not send.
    Signaled { signal: i32 },
    /// Terminated by the host (`terminate`, `kill` or drop).
    Killed,
    /// The exit status could not be collected.
    Unknown,
}

impl ExitReason {
    #[must_use]
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    #[must_use]
    pub fn label(self) -> String {
        match self {
            Self::Exited { code } => format!("exited with code {code}"),
            Self::Signaled { signal } => format!("terminated by signal {signal}"),
            Self::Killed => "killed by host".to_string(),
            Self::Unknown => "exit status unavailable".to_string(),
        }
    }
}

/// Output streams of a freshly spawned process. The caller owns reading them.
pub struct ProcessOutput {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Terminate,
    Interrupt,
    Kill,
}

/// A running backend process.
///
/// The child itself lives inside a monitor task; this handle talks to it over
/// a control channel and observes the exit through a `watch` channel, so any
/// number of waiters see the same [`ExitReason`]. Dropping the handle kills
/// the process.
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    control_tx: mpsc::UnboundedSender<Control>,
    exit_rx: watch::Receiver<Option<ExitReason>>,
}

impl ProcessHandle {
    pub fn spawn(config: ProcessConfig) -> Result<(Self, ProcessOutput), SpawnError> {
        if !config.cwd.is_dir() {
            return Err(SpawnError::WorkingDirInvalid { path: config.cwd });
        }

        let home_var = config.home.as_ref().map(|(var, _)| var.as_str());
        let program_path = resolve_binary(&config.program, home_var).ok_or_else(|| {
            SpawnError::BinaryNotFound {
                program: config.program.clone(),
            }
        })?;

        let mut cmd = Command::new(&program_path);
        cmd.args(&config.args)
            .current_dir(&config.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();

        for name in INHERITED_ENV_VARS
            .iter()
            .copied()
            .chain(config.inherit_env.iter().map(String::as_str))
        {
            if let Some(value) = std::env::var_os(name) {
                cmd.env(name, value);
            }
        }
        if let Some(path) = augmented_path(&program_path, home_var) {
            cmd.env("PATH", path);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some((var, path)) = &config.home {
            cmd.env(var, path);
        }

        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => SpawnError::BinaryNotFound {
                program: config.program.clone(),
            },
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
                program: config.program.clone(),
            },
            _ => SpawnError::Io {
                program: config.program.clone(),
                source,
            },
        })?;

        let pipe_missing = |stream| SpawnError::PipeMissing {
            program: config.program.clone(),
            stream,
        };
        let stdin = child.stdin.take().ok_or_else(|| pipe_missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_missing("stderr"))?;

        let pid = child.id();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, pid, config.program.clone(), control_rx, exit_tx));

        tracing::debug!(program = %config.program, ?pid, cwd = %config.cwd.display(), "Spawned backend process");

        Ok((
            Self {
                program: config.program,
                pid,
                stdin: Mutex::new(Some(stdin)),
                control_tx,
                exit_rx,
            },
            ProcessOutput { stdout, stderr },
        ))
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write raw bytes to the child's stdin and flush.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        if self.exit_reason().is_some() {
            return Err(WriteError::ProcessExited);
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(WriteError::ProcessExited);
        };
        let result = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                guard.take();
                Err(WriteError::ProcessExited)
            }
            Err(err) => Err(WriteError::Io(err)),
        }
    }

    /// Close stdin so the child sees EOF.
    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.exit_rx.borrow()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.exit_reason().is_none()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitReason {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ExitReason::Unknown),
            Err(_) => self.exit_reason().unwrap_or(ExitReason::Unknown),
        }
    }

    /// A receiver that flips to `Some` when the process exits.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitReason>> {
        self.exit_rx.clone()
    }

    /// Ask the process to stop (SIGTERM on unix). No-op after exit.
    pub fn terminate(&self) {
        let _ = self.control_tx.send(Control::Terminate);
    }

    /// Force the process to stop. No-op after exit.
    pub fn kill(&self) {
        let _ = self.control_tx.send(Control::Kill);
    }

    /// Deliver an interrupt (SIGINT) without ending the process.
    /// Returns `false` where interrupts are not supported.
    pub fn signal_interrupt(&self) -> bool {
        if !cfg!(unix) || !self.is_alive() {
            return false;
        }
        self.control_tx.send(Control::Interrupt).is_ok()
    }

    /// Graceful terminate, then a forced kill once `grace` elapses.
    pub async fn shutdown(&self, grace: Duration) -> ExitReason {
        if let Some(reason) = self.exit_reason() {
            return reason;
        }
        self.close_stdin().await;
        self.terminate();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(reason) => reason,
            Err(_) => {
                tracing::warn!(program = %self.program, pid = ?self.pid, ?grace, "Backend ignored terminate, killing");
                self.kill();
                self.wait().await
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Kill);
    }
}

async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    program: String,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    exit_tx: watch::Sender<Option<ExitReason>>,
) {
    let mut host_stopped = false;
    let mut control_open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            control = control_rx.recv(), if control_open => match control {
                Some(Control::Terminate) => {
                    host_stopped = true;
                    if !send_signal(pid, Control::Terminate) {
                        let _ = child.start_kill();
                    }
                }
                Some(Control::Interrupt) => {
                    if !send_signal(pid, Control::Interrupt) {
                        tracing::debug!(program = %program, ?pid, "Interrupt signal not delivered");
                    }
                }
                Some(Control::Kill) | None => {
                    if control.is_none() {
                        control_open = false;
                    }
                    host_stopped = true;
                    let _ = child.start_kill();
                }
            },
        }
    };

    let reason = classify_exit(status, host_stopped);
    tracing::debug!(program = %program, ?pid, reason = %reason.label(), "Backend process exited");
    let _ = exit_tx.send(Some(reason));
}

fn classify_exit(status: io::Result<ExitStatus>, host_stopped: bool) -> ExitReason {
    let Ok(status) = status else {
        return ExitReason::Unknown;
    };
    if host_stopped {
        return ExitReason::Killed;
    }
    if let Some(code) = status.code() {
        return ExitReason::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitReason::Signaled { signal };
        }
    }
    ExitReason::Unknown
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, control: Control) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let signal = match control {
        Control::Terminate => Signal::SIGTERM,
        Control::Interrupt => Signal::SIGINT,
        Control::Kill => Signal::SIGKILL,
    };
    kill(Pid::from_raw(pid), signal).is_ok()
}

#[cfg(not(unix))]
fn send_signal(_pid: Option<u32>, _control: Control) -> bool {
    false
}
