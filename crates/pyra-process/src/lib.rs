//! Supervision of the foreground Python interpreter process.
//!
//! The editor runs at most one user program at a time. [`Supervisor`] owns that
//! process exclusively: it spawns it (directly or through the `uv` package
//! runner), streams its stdout/stderr back as complete lines, and tears it down
//! on request, escalating from a graceful signal to a forceful kill when the
//! program does not cooperate.

mod lines;
mod supervisor;

use std::{
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::mpsc;

pub use crate::lines::LineBuffer;
pub use crate::supervisor::Supervisor;

/// How the interpreter is invoked for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// `<python> [interpreter args] <script>`
    Direct,
    /// `<runner> run python [interpreter args] <script>`, so the project's
    /// declared dependencies are synced before the script starts.
    PackageRunner,
}

/// A request to run one script. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub mode: RunMode,
    pub script: PathBuf,
    pub cwd: PathBuf,
    /// Arguments placed between the interpreter and the script (e.g. `-m debugpy ...`).
    pub interpreter_args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl RunRequest {
    pub fn new(mode: RunMode, script: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            script: script.into(),
            cwd: cwd.into(),
            interpreter_args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn direct(script: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self::new(RunMode::Direct, script, cwd)
    }

    pub fn package_runner(script: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self::new(RunMode::PackageRunner, script, cwd)
    }

    pub fn with_interpreter_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.interpreter_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Where to find the interpreter and how long to wait for it to die.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Explicit interpreter; skips virtualenv discovery when set.
    pub python: Option<PathBuf>,
    /// Used when no explicit interpreter is set and the project has no virtualenv.
    pub fallback_python: PathBuf,
    /// Project-relative virtualenv directory.
    pub venv_dir: PathBuf,
    pub package_runner: PathBuf,
    /// Time between the graceful termination signal and the forceful kill.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            python: None,
            fallback_python: PathBuf::from(if cfg!(windows) { "python" } else { "python3" }),
            venv_dir: PathBuf::from(".venv"),
            package_runner: PathBuf::from("uv"),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl SupervisorConfig {
    /// Interpreter used for [`RunMode::Direct`] runs rooted at `cwd`.
    pub fn resolve_python(&self, cwd: &Path) -> PathBuf {
        if let Some(python) = &self.python {
            return python.clone();
        }

        let venv = cwd.join(&self.venv_dir);
        let candidate = if cfg!(windows) {
            venv.join("Scripts").join("python.exe")
        } else {
            venv.join("bin").join("python")
        };
        if candidate.exists() {
            candidate
        } else {
            self.fallback_python.clone()
        }
    }

    /// Program and leading arguments that start the interpreter for
    /// `request`, before any interpreter args or the script.
    pub fn interpreter_for(&self, request: &RunRequest) -> (PathBuf, Vec<OsString>) {
        match request.mode {
            RunMode::Direct => (self.resolve_python(&request.cwd), Vec::new()),
            RunMode::PackageRunner => (
                self.package_runner.clone(),
                vec!["run".into(), "python".into()],
            ),
        }
    }

    /// The full command line a request turns into.
    pub fn command_for(&self, request: &RunRequest) -> CommandSpec {
        let (program, mut args) = self.interpreter_for(request);
        args.extend(request.interpreter_args.iter().cloned());
        args.push(request.script.clone().into_os_string());

        let mut env = vec![(OsString::from("PYTHONUNBUFFERED"), OsString::from("1"))];
        env.extend(request.env.iter().cloned());

        CommandSpec {
            cwd: request.cwd.clone(),
            program,
            args,
            env,
        }
    }
}

/// A full command invocation (cwd + program + args + env overrides).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: PathBuf,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human-readable only; not meant to round-trip through a shell.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Identifies one run of the supervisor. Never reused within a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(u64);

impl RunId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Token addressing the process of one run.
///
/// The OS child itself stays inside the supervisor; holders of a handle can
/// only ask the supervisor to stop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    run_id: RunId,
    pid: Option<u32>,
    command: String,
}

impl ProcessHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Display form of the spawned command line.
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The program exited on its own.
    Exited,
    /// Killed by a signal nobody in this process sent.
    Signaled(i32),
    /// Terminated through [`Supervisor::stop`].
    Stopped,
    /// The OS wait itself failed; the exit status is unknown.
    WaitFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub cause: ExitCause,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.cause == ExitCause::Exited && self.code == Some(0)
    }

    fn from_wait(status: io::Result<std::process::ExitStatus>, stopped: bool) -> Self {
        let status = match status {
            Ok(status) => status,
            Err(_) => {
                return Self {
                    code: None,
                    cause: if stopped { ExitCause::Stopped } else { ExitCause::WaitFailed },
                }
            }
        };

        let code = status.code();
        let cause = if stopped {
            ExitCause::Stopped
        } else if code.is_some() {
            ExitCause::Exited
        } else {
            signal_of(&status).map_or(ExitCause::WaitFailed, ExitCause::Signaled)
        };
        Self { code, cause }
    }
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.cause, self.code) {
            (ExitCause::Exited, Some(code)) => write!(f, "exited with code {code}"),
            (ExitCause::Exited, None) => write!(f, "exited"),
            (ExitCause::Signaled(sig), _) => write!(f, "killed by signal {sig}"),
            (ExitCause::Stopped, _) => write!(f, "stopped"),
            (ExitCause::WaitFailed, _) => write!(f, "exit status unavailable"),
        }
    }
}

/// Output of a run, in the order it was produced per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// Always the last event of a run, delivered exactly once.
    Completed(ExitInfo),
}

/// Event stream of a single run.
#[derive(Debug)]
pub struct RunEvents {
    run_id: RunId,
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl RunEvents {
    /// Wrap an existing event channel, e.g. to replay a recorded run.
    pub fn from_parts(run_id: RunId, rx: mpsc::UnboundedReceiver<ProcessEvent>) -> Self {
        Self { run_id, rx }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next event; `None` once `Completed` has been received.
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("a process is already running (run {run_id}, pid {pid:?}); stop it first")]
    AlreadyRunning { run_id: RunId, pid: Option<u32> },

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    fn spawn(command: &CommandSpec, source: io::Error) -> Self {
        Self::Spawn {
            command: command.to_string(),
            source,
        }
    }
}
