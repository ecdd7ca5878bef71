use std::{
    io,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    ExitInfo, LineBuffer, ProcessEvent, ProcessHandle, RunEvents, RunId, RunRequest,
    SupervisorConfig, SupervisorError,
};

/// Extra time `stop` waits beyond the grace period for the reaper to report.
const REAP_SLACK: Duration = Duration::from_secs(2);

struct ActiveRun {
    handle: ProcessHandle,
    cancel: CancellationToken,
    done: watch::Receiver<Option<ExitInfo>>,
}

struct Inner {
    config: SupervisorConfig,
    slot: Mutex<Option<ActiveRun>>,
    last_exit: Mutex<Option<(RunId, ExitInfo)>>,
    next_run: AtomicU64,
}

/// Owner of the single foreground interpreter process.
///
/// Starting a run while another one is alive is rejected with
/// [`SupervisorError::AlreadyRunning`]; callers that want to replace a run
/// stop it first. Independent supervisors share nothing, so tests can run
/// several side by side.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slot: Mutex::new(None),
                last_exit: Mutex::new(None),
                next_run: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Handle of the live process, if any.
    pub fn current(&self) -> Option<ProcessHandle> {
        self.inner.slot.lock().as_ref().map(|run| run.handle.clone())
    }

    pub fn is_running(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    /// Spawn the interpreter for `request`.
    ///
    /// The returned [`RunEvents`] yields stdout/stderr lines as they are
    /// produced and finishes with exactly one [`ProcessEvent::Completed`].
    pub async fn start(
        &self,
        request: RunRequest,
    ) -> Result<(ProcessHandle, RunEvents), SupervisorError> {
        let mut slot = self.inner.slot.lock();
        if let Some(active) = slot.as_ref() {
            return Err(SupervisorError::AlreadyRunning {
                run_id: active.handle.run_id,
                pid: active.handle.pid,
            });
        }

        let spec = self.inner.config.command_for(&request);
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so `stop` reaches wrappers like `uv run` together
        // with the interpreter they spawn.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                // SAFETY: `setpgid` is async-signal-safe and does not allocate.
                // This is executed after `fork` in the child process.
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|source| SupervisorError::spawn(&spec, source))?;

        let run_id = RunId(self.inner.next_run.fetch_add(1, Ordering::Relaxed));
        let handle = ProcessHandle {
            run_id,
            pid: child.id(),
            command: spec.to_string(),
        };
        tracing::info!(
            target: "pyra.process",
            run = %run_id,
            pid = ?handle.pid,
            command = %handle.command,
            "started process"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);

        *slot = Some(ActiveRun {
            handle: handle.clone(),
            cancel: cancel.clone(),
            done: done_rx,
        });
        drop(slot);

        tokio::spawn(supervise(Reaper {
            inner: self.inner.clone(),
            run_id,
            child,
            stdout_task: stdout.map(|out| tokio::spawn(pump_lines(out, Stream::Stdout, events_tx.clone()))),
            stderr_task: stderr.map(|err| tokio::spawn(pump_lines(err, Stream::Stderr, events_tx.clone()))),
            events: events_tx,
            cancel,
            done: done_tx,
        }));

        Ok((
            handle,
            RunEvents {
                run_id,
                rx: events_rx,
            },
        ))
    }

    /// Stop the process of `handle`.
    ///
    /// Sends a graceful termination signal, then kills the process tree if it
    /// is still alive after the configured grace period. Idempotent: stopping
    /// a run that already ended returns its recorded exit (or `None` when the
    /// supervisor no longer remembers it). Always resolves.
    pub async fn stop(&self, handle: &ProcessHandle) -> Option<ExitInfo> {
        let active = {
            let slot = self.inner.slot.lock();
            slot.as_ref()
                .filter(|run| run.handle.run_id == handle.run_id)
                .map(|run| (run.cancel.clone(), run.done.clone()))
        };

        let Some((cancel, mut done)) = active else {
            return self.recorded_exit(handle.run_id);
        };

        tracing::debug!(target: "pyra.process", run = %handle.run_id, "stopping process");
        cancel.cancel();

        // Termination takes at most one grace period and joining the stream
        // readers another.
        let bound = self.inner.config.stop_grace * 2 + REAP_SLACK;
        let reported = match tokio::time::timeout(bound, done.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => *exit,
            Ok(Err(_)) | Err(_) => None,
        };
        match reported {
            Some(exit) => Some(exit),
            None => {
                tracing::warn!(
                    target: "pyra.process",
                    run = %handle.run_id,
                    "process did not report an exit after stop"
                );
                self.recorded_exit(handle.run_id)
            }
        }
    }

    /// Stop whatever is running, if anything.
    pub async fn stop_current(&self) -> Option<ExitInfo> {
        let handle = self.current()?;
        self.stop(&handle).await
    }

    fn recorded_exit(&self, run_id: RunId) -> Option<ExitInfo> {
        let last = *self.inner.last_exit.lock();
        last.filter(|(id, _)| *id == run_id).map(|(_, exit)| exit)
    }
}

#[derive(Clone, Copy, Debug)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn event(self, line: String) -> ProcessEvent {
        match self {
            Stream::Stdout => ProcessEvent::Stdout(line),
            Stream::Stderr => ProcessEvent::Stderr(line),
        }
    }
}

async fn pump_lines<R>(mut reader: R, stream: Stream, events: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(target: "pyra.process", ?stream, error = %err, "stream read failed");
                break;
            }
        };
        for line in lines.push(&buf[..n]) {
            let _ = events.send(stream.event(line));
        }
    }
    if let Some(line) = lines.finish() {
        let _ = events.send(stream.event(line));
    }
}

struct Reaper {
    inner: Arc<Inner>,
    run_id: RunId,
    child: Child,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    cancel: CancellationToken,
    done: watch::Sender<Option<ExitInfo>>,
}

async fn supervise(mut run: Reaper) {
    let grace = run.inner.config.stop_grace;
    let (status, stopped) = tokio::select! {
        status = run.child.wait() => (status, false),
        _ = run.cancel.cancelled() => (terminate_process_tree(&mut run.child, grace).await, true),
    };
    let exit = ExitInfo::from_wait(status, stopped);

    // Stream readers finish at EOF. A grandchild that inherited the pipes can
    // hold them open past the interpreter's exit; bound that by the grace period.
    for task in [run.stdout_task.take(), run.stderr_task.take()].into_iter().flatten() {
        join_reader(task, grace).await;
    }

    // Recorded before the slot is released so a concurrent `stop` that misses
    // the slot still finds the exit.
    *run.inner.last_exit.lock() = Some((run.run_id, exit));
    {
        let mut slot = run.inner.slot.lock();
        if slot.as_ref().is_some_and(|active| active.handle.run_id == run.run_id) {
            *slot = None;
        }
    }

    tracing::info!(target: "pyra.process", run = %run.run_id, %exit, "process completed");
    let _ = run.done.send(Some(exit));
    let _ = run.events.send(ProcessEvent::Completed(exit));
}

async fn join_reader(mut task: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        task.abort();
        let _ = task.await;
    }
}

async fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pgid = pid as i32;
            // Negative pid targets the process group, which we set to the child's pid via
            // `setpgid(0, 0)` in `pre_exec`.
            unsafe {
                let _ = libc::kill(-pgid, libc::SIGTERM);
            }

            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status;
            }

            tracing::debug!(target: "pyra.process", pid, "grace period elapsed; killing process group");
            unsafe {
                let _ = libc::kill(-pgid, libc::SIGKILL);
            }
        }
        let _ = child.start_kill();
        child.wait().await
    }

    #[cfg(windows)]
    {
        let _ = grace;
        // `start_kill` only terminates the immediate process; `uv run` leaves the
        // interpreter behind holding the pipes. `taskkill /T` takes the full tree.
        if let Some(pid) = child.id() {
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
        let _ = child.start_kill();
        child.wait().await
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = grace;
        let _ = child.start_kill();
        child.wait().await
    }
}
