//! Starting a program under the debug adapter.
//!
//! The debuggee runs through the [`Supervisor`] like any other program, with
//! the adapter module injected in front of the script. Once the adapter
//! listens, a [`DebugSession`] is attached and the DAP configuration handshake
//! runs to completion before the launch is reported.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    ffi::OsString,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use pyra_config::DebugConfig;
use pyra_process::{ExitInfo, ProcessEvent, ProcessHandle, RunEvents, RunRequest, Supervisor};
use tokio::{
    net::{TcpListener, TcpStream},
    process::Command,
    sync::watch,
};

use crate::client::{ConnectionConfig, DapConnection};
use crate::dap::types::{InitializeArguments, LaunchArguments};
use crate::error::{DebugError, DebugResult};
use crate::router::RouterSender;
use crate::session::{DebugSession, RunState};

/// Stderr lines kept for connect failure reports.
const EARLY_STDERR_LINES: usize = 20;

/// Bound on the `-m <adapter> --version` check.
const ADAPTER_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub run: RunRequest,
    /// Initial breakpoints, installed before the program is allowed to run.
    pub breakpoints: BTreeMap<PathBuf, BTreeSet<i64>>,
    pub stop_on_entry: bool,
}

impl LaunchRequest {
    pub fn new(run: RunRequest) -> Self {
        Self {
            run,
            breakpoints: BTreeMap::new(),
            stop_on_entry: false,
        }
    }

    pub fn with_breakpoint(mut self, path: impl Into<PathBuf>, line: i64) -> Self {
        self.breakpoints.entry(path.into()).or_default().insert(line);
        self
    }
}

#[derive(Debug, Clone)]
pub struct DebugLaunch {
    pub session: DebugSession,
    pub process: ProcessHandle,
}

/// Start `request` under the debug adapter and complete the handshake.
///
/// The interpreter is first asked for the adapter module's version so a
/// missing adapter is reported as [`DebugError::AdapterUnavailable`] instead
/// of a connect timeout. Process output and session events are published
/// through `router`. On any failure the debuggee is stopped before the error
/// is returned.
pub async fn launch(
    supervisor: &Supervisor,
    config: &DebugConfig,
    router: RouterSender,
    request: LaunchRequest,
) -> DebugResult<DebugLaunch> {
    let port = match config.port {
        Some(port) => port,
        None => free_port(&config.host).await?,
    };
    let listen = format!("{}:{port}", config.host);

    let LaunchRequest {
        mut run,
        breakpoints,
        stop_on_entry,
    } = request;
    check_adapter(supervisor, config, &run).await?;

    let mut args: Vec<OsString> = vec![
        "-m".into(),
        config.adapter_module.clone().into(),
        "--listen".into(),
        listen.clone().into(),
        "--wait-for-client".into(),
    ];
    args.append(&mut run.interpreter_args);
    run.interpreter_args = args;

    let launch_args = LaunchArguments {
        name: format!("Pyra: {}", run.script.display()),
        type_: "python".to_owned(),
        request: "launch".to_owned(),
        program: run.script.to_string_lossy().into_owned(),
        cwd: run.cwd.to_string_lossy().into_owned(),
        console: "internalConsole".to_owned(),
        just_my_code: config.just_my_code,
        stop_on_entry,
    };

    let (process, events) = supervisor.start(run).await?;
    tracing::info!(
        target: "pyra.launch",
        run = %process.run_id(),
        adapter = %listen,
        "debuggee started; waiting for adapter"
    );
    let debuggee = forward_debuggee(events, router.clone());

    let stream = match connect_with_retries(config, port, &debuggee).await {
        Ok(stream) => stream,
        Err(err) => {
            supervisor.stop(&process).await;
            return Err(err);
        }
    };

    let (conn, conn_events) = DapConnection::from_tcp(
        stream,
        ConnectionConfig {
            request_timeout: config.request_timeout(),
        },
    );
    let (session, mut debug_events) = DebugSession::start(conn, conn_events);

    let session_id = session.id();
    tokio::spawn(async move {
        while let Some(event) = debug_events.recv().await {
            router.debug(session_id, event);
        }
    });
    tokio::spawn(bridge_exit(session.clone(), debuggee.exit.clone()));

    if let Err(err) = handshake(&session, launch_args, &breakpoints).await {
        tracing::warn!(target: "pyra.launch", session = %session_id, error = %err, "debug handshake failed");
        session.connection().shutdown();
        supervisor.stop(&process).await;
        return Err(err);
    }

    tracing::info!(target: "pyra.launch", session = %session_id, run = %process.run_id(), "debug session configured");
    Ok(DebugLaunch { session, process })
}

/// Run the DAP configuration sequence on a fresh session.
///
/// `launch` is sent without waiting for its answer because debugpy only
/// emits `initialized` after it; the answer is collected last.
pub async fn handshake(
    session: &DebugSession,
    launch: LaunchArguments,
    breakpoints: &BTreeMap<PathBuf, BTreeSet<i64>>,
) -> DebugResult<()> {
    let conn = session.connection();
    conn.request("initialize", InitializeArguments::default())
        .await?;

    let launch_pending = conn.send_request("launch", serde_json::to_value(&launch)?)?;

    let timeout = conn.request_timeout();
    let mut status = session.subscribe_status();
    let configured = tokio::time::timeout(
        timeout,
        status.wait_for(|status| status.state != RunState::Launching),
    )
    .await
    .map_err(|_| DebugError::Timeout {
        command: "initialized".to_owned(),
        after: timeout,
    })?
    .map(|status| status.state)
    .unwrap_or(RunState::Terminated);
    if configured == RunState::Terminated {
        return Err(DebugError::SessionTerminated);
    }

    for (path, lines) in breakpoints {
        session.set_breakpoints(path, lines.clone()).await?;
    }
    session.configuration_done().await?;
    launch_pending.response().await?;
    Ok(())
}

/// Run `<interpreter> -m <adapter> --version` in the program's directory.
///
/// An interpreter that cannot be spawned passes; the supervisor reports that
/// failure when the debuggee itself is started.
async fn check_adapter(
    supervisor: &Supervisor,
    config: &DebugConfig,
    run: &RunRequest,
) -> DebugResult<()> {
    let (program, prefix) = supervisor.config().interpreter_for(run);
    let mut cmd = Command::new(&program);
    cmd.args(&prefix)
        .args(["-m", config.adapter_module.as_str(), "--version"])
        .current_dir(&run.cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let unavailable = |detail: String| DebugError::AdapterUnavailable {
        module: config.adapter_module.clone(),
        interpreter: program.display().to_string(),
        detail,
    };
    let output = match tokio::time::timeout(ADAPTER_CHECK_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(target: "pyra.launch", python = %program.display(), error = %err, "skipping adapter check");
            return Ok(());
        }
        Err(_) => {
            return Err(unavailable(format!(
                "no answer to `--version` within {ADAPTER_CHECK_TIMEOUT:?}"
            )))
        }
    };

    if output.status.success() {
        tracing::debug!(
            target: "pyra.launch",
            module = %config.adapter_module,
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "debug adapter available"
        );
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("version check exited with {}", output.status));
    Err(unavailable(detail))
}

async fn free_port(host: &str) -> DebugResult<u16> {
    let listener = TcpListener::bind((host, 0)).await?;
    Ok(listener.local_addr()?.port())
}

struct Debuggee {
    exit: watch::Receiver<Option<ExitInfo>>,
    stderr: Arc<Mutex<VecDeque<String>>>,
}

impl Debuggee {
    fn exited(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    fn stderr_tail(&self) -> String {
        let lines = self.stderr.lock();
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Publish the debuggee's output and remember its exit and last stderr lines.
fn forward_debuggee(mut events: RunEvents, router: RouterSender) -> Debuggee {
    let (exit_tx, exit_rx) = watch::channel(None);
    let stderr = Arc::new(Mutex::new(VecDeque::with_capacity(EARLY_STDERR_LINES)));
    let tail = stderr.clone();
    let run = events.run_id();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                ProcessEvent::Stderr(line) => {
                    let mut tail = tail.lock();
                    if tail.len() == EARLY_STDERR_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
                ProcessEvent::Completed(exit) => {
                    exit_tx.send_replace(Some(*exit));
                }
                ProcessEvent::Stdout(_) => {}
            }
            router.process(run, event);
        }
    });

    Debuggee {
        exit: exit_rx,
        stderr,
    }
}

async fn connect_with_retries(
    config: &DebugConfig,
    port: u16,
    debuggee: &Debuggee,
) -> DebugResult<TcpStream> {
    let addr = format!("{}:{port}", config.host);
    let attempts = config.connect_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if let Some(exit) = debuggee.exited() {
            return Err(DebugError::Connect {
                addr,
                attempts: attempt - 1,
                detail: format!(
                    "debuggee exited ({:?}, code {:?}) before the adapter accepted a connection; stderr:\n{}",
                    exit.cause,
                    exit.code,
                    debuggee.stderr_tail()
                ),
            });
        }
        match TcpStream::connect((config.host.as_str(), port)).await {
            Ok(stream) => {
                tracing::debug!(target: "pyra.launch", %addr, attempt, "connected to debug adapter");
                return Ok(stream);
            }
            Err(err) => {
                tracing::trace!(target: "pyra.launch", %addr, attempt, error = %err, "adapter not ready");
                last_error = err.to_string();
            }
        }
        if attempt < attempts {
            tokio::time::sleep(config.connect_interval()).await;
        }
    }

    let stderr = debuggee.stderr_tail();
    let detail = if stderr.is_empty() {
        last_error
    } else {
        format!("{last_error}; stderr:\n{stderr}")
    };
    Err(DebugError::Connect {
        addr,
        attempts,
        detail,
    })
}

/// Terminate `session` when the debuggee process goes away.
async fn bridge_exit(session: DebugSession, mut exit: watch::Receiver<Option<ExitInfo>>) {
    let exited = tokio::select! {
        exited = async { exit.wait_for(Option::is_some).await.ok().and_then(|exit| *exit) } => exited,
        _ = session.wait_for_state(RunState::Terminated) => None,
    };
    if let Some(info) = exited {
        session.notify_debuggee_exited(info);
    }
}
