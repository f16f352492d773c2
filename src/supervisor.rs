/// Child process lifecycle: spawn the VPN client, stream its merged
/// stdout/stderr as lines, answer liveness queries, and tear it down.
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Buffered lines between the pipe readers and the consumer.
const LINE_BUFFER: usize = 1024;

/// Upper bound on how long the fallback termination command may run.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Program plus arguments used to launch the VPN client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    program: String,
    args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a full argument vector. An empty vector yields an empty
    /// program name, which fails at spawn time.
    pub fn from_argv(mut argv: Vec<String>) -> Self {
        if argv.is_empty() {
            return Self::new(String::new(), Vec::new());
        }
        let program = argv.remove(0);
        Self::new(program, argv)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl std::fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of a bounded wait for the next output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    Timeout,
    /// Both output pipes closed, or no process is tracked.
    Eof,
}

/// Errors that can occur when launching the child.
#[derive(Debug)]
pub enum SupervisorError {
    /// The launcher could not start (binary missing, permission denied).
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// A live child is already tracked.
    AlreadyRunning { pid: u32 },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { command, source } => {
                write!(f, "failed to spawn `{command}`: {source}")
            }
            SupervisorError::AlreadyRunning { pid } => {
                write!(f, "a VPN process is already running (pid {pid})")
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::AlreadyRunning { .. } => None,
        }
    }
}

/// A cleanup step that failed during `terminate()`. Logged, never raised.
#[derive(Debug)]
pub enum ShutdownError {
    Signal { pid: u32, source: nix::Error },
    Kill { pid: u32, source: std::io::Error },
    Wait { pid: u32, source: std::io::Error },
    StillRunning { pid: u32 },
    Fallback { command: String, source: std::io::Error },
    FallbackTimeout { command: String },
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Signal { pid, source } => {
                write!(f, "failed to signal pid {pid}: {source}")
            }
            ShutdownError::Kill { pid, source } => write!(f, "failed to kill pid {pid}: {source}"),
            ShutdownError::Wait { pid, source } => {
                write!(f, "failed to wait for pid {pid}: {source}")
            }
            ShutdownError::StillRunning { pid } => {
                write!(f, "pid {pid} still running after kill")
            }
            ShutdownError::Fallback { command, source } => {
                write!(f, "fallback termination `{command}` failed: {source}")
            }
            ShutdownError::FallbackTimeout { command } => {
                write!(f, "fallback termination `{command}` timed out")
            }
        }
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShutdownError::Signal { source, .. } => Some(source),
            ShutdownError::Kill { source, .. } => Some(source),
            ShutdownError::Wait { source, .. } => Some(source),
            ShutdownError::Fallback { source, .. } => Some(source),
            ShutdownError::StillRunning { .. } | ShutdownError::FallbackTimeout { .. } => None,
        }
    }
}

/// The spawned process and its merged output stream.
struct ChildProcess {
    child: Child,
    pid: u32,
    lines: mpsc::Receiver<String>,
    exit_code: Option<i32>,
    exited: bool,
}

/// Owns at most one child process at a time.
pub struct ProcessSupervisor {
    current: Option<ChildProcess>,
    kill_fallback: Vec<String>,
    grace: Duration,
}

impl ProcessSupervisor {
    /// `kill_fallback` is the broad termination command run on every
    /// `terminate()` of a tracked process; `grace` bounds each wait for exit.
    pub fn new(kill_fallback: Vec<String>, grace: Duration) -> Self {
        Self {
            current: None,
            kill_fallback,
            grace,
        }
    }

    /// Launch `command` with stdout and stderr merged into one line stream.
    pub fn spawn(&mut self, command: &LaunchCommand) -> Result<u32, SupervisorError> {
        if let Some(pid) = self.pid() {
            if self.is_alive() {
                return Err(SupervisorError::AlreadyRunning { pid });
            }
        }

        tracing::info!(command = %command, "spawning VPN client");

        // stdin stays inherited so an elevation prompt can reach the terminal.
        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        tracing::info!(pid, "VPN client started");
        self.current = Some(ChildProcess {
            child,
            pid,
            lines: rx,
            exit_code: None,
            exited: false,
        });
        Ok(pid)
    }

    /// Wait up to `timeout` for the next complete output line.
    pub async fn read_line(&mut self, timeout: Duration) -> ReadOutcome {
        let Some(current) = self.current.as_mut() else {
            return ReadOutcome::Eof;
        };
        match tokio::time::timeout(timeout, current.lines.recv()).await {
            Ok(Some(line)) => ReadOutcome::Line(line),
            Ok(None) => ReadOutcome::Eof,
            Err(_) => ReadOutcome::Timeout,
        }
    }

    /// Non-blocking liveness check. Records the exit code once observed.
    pub fn is_alive(&mut self) -> bool {
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        if current.exited {
            return false;
        }
        match current.child.try_wait() {
            Ok(Some(status)) => {
                current.exited = true;
                current.exit_code = status.code();
                tracing::debug!(pid = current.pid, exit_code = ?current.exit_code, "VPN client exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(pid = current.pid, error = %e, "failed to poll VPN client status");
                true
            }
        }
    }

    /// Exit code of the tracked process, if it has exited with one.
    /// `None` while running or when killed by a signal.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.is_alive();
        self.current.as_ref().and_then(|c| c.exit_code)
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().map(|c| c.pid)
    }

    /// Best-effort teardown: SIGTERM, wait, SIGKILL, wait, then the fallback
    /// command. Every step runs regardless of earlier failures. Idempotent:
    /// the tracked process is released, so a second call is a no-op.
    /// Returns the released process's exit code, when it had one.
    pub async fn terminate(&mut self) -> Option<i32> {
        let Some(mut current) = self.current.take() else {
            return None;
        };
        let pid = current.pid;
        tracing::info!(pid, "terminating VPN client");

        for err in stop_child(&mut current, self.grace).await {
            tracing::warn!(pid, error = %err, "cleanup step failed");
        }
        if let Err(err) = run_fallback(&self.kill_fallback).await {
            tracing::warn!(pid, error = %err, "cleanup step failed");
        }

        tracing::info!(pid, exit_code = ?current.exit_code, "VPN client stopped");
        current.exit_code
    }
}

/// Signal the direct handle and wait for it, escalating to SIGKILL.
async fn stop_child(current: &mut ChildProcess, grace: Duration) -> Vec<ShutdownError> {
    let mut errors = Vec::new();
    let pid = current.pid;

    if !current.exited {
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => {
                if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    errors.push(ShutdownError::Signal { pid, source: e });
                }
            }
            _ => {}
        }

        match wait_for_exit(current, grace).await {
            Ok(true) => return errors,
            Ok(false) => {}
            Err(e) => errors.push(e),
        }

        if let Err(e) = current.child.start_kill() {
            errors.push(ShutdownError::Kill { pid, source: e });
        }
        match wait_for_exit(current, grace).await {
            Ok(true) => {}
            Ok(false) => errors.push(ShutdownError::StillRunning { pid }),
            Err(e) => errors.push(e),
        }
    }

    errors
}

/// `Ok(true)` if the child exited within `grace`.
async fn wait_for_exit(current: &mut ChildProcess, grace: Duration) -> Result<bool, ShutdownError> {
    match tokio::time::timeout(grace, current.child.wait()).await {
        Ok(Ok(status)) => {
            current.exited = true;
            current.exit_code = status.code();
            Ok(true)
        }
        Ok(Err(e)) => Err(ShutdownError::Wait {
            pid: current.pid,
            source: e,
        }),
        Err(_) => Ok(false),
    }
}

/// Run the broad termination command, e.g. `sudo killall openvpn`, to catch
/// re-exec'd descendants the direct handle lost track of.
async fn run_fallback(argv: &[String]) -> Result<(), ShutdownError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let command = argv.join(" ");
    tracing::debug!(command = %command, "running fallback termination");

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(FALLBACK_TIMEOUT, status).await {
        Ok(Ok(status)) => {
            // killall exits nonzero when nothing matched, which is the common case.
            tracing::debug!(command = %command, code = ?status.code(), "fallback termination finished");
            Ok(())
        }
        Ok(Err(e)) => Err(ShutdownError::Fallback { command, source: e }),
        Err(_) => Err(ShutdownError::FallbackTimeout { command }),
    }
}

/// Forward lines from one pipe into the shared channel until EOF.
/// Invalid UTF-8 is replaced rather than ending the stream.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}
