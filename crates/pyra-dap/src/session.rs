//! Debug session state machine.
//!
//! A single actor task owns the run state. Adapter events, debuggee exit
//! notifications and client commands all arrive over channels and are applied
//! in order, so a resume issued by the client can never interleave with a
//! `stopped` event half-way. Callers observe the state through a `watch`
//! snapshot and the [`DebugEvent`] stream.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use pyra_process::{ExitCause, ExitInfo};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::breakpoints::{set_breakpoints_arguments, BreakpointSet};
use crate::client::{parse_body, CloseReason, ConnectionEvent, DapConnection};
use crate::dap::messages::Event;
use crate::dap::types::{
    ContinuedEventBody, DisconnectArguments, ExitedEventBody, OutputEventBody,
    SetBreakpointsResponseBody, StoppedEventBody, ThreadArguments, ThreadEventBody,
    ThreadsResponseBody,
};
use crate::error::{DebugError, DebugResult};
use crate::inspection::{FrameRef, Generation, InspectionTree, Scope, StackFrame, VarRef, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Launching,
    Configuring,
    Running,
    Paused,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Launching => "launching",
            RunState::Configuring => "configuring",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    /// The program ran to completion (or the adapter reported it gone).
    Exited { exit_code: Option<i64> },
    /// The debuggee was killed by a signal nobody here sent.
    Signaled { signal: i32 },
    /// The adapter stream ended. `CloseReason::Decode` marks a corrupt frame.
    ConnectionLost { reason: CloseReason },
    UserStopped,
}

impl TerminationCause {
    /// How a supervised debuggee's exit ends the session.
    pub fn from_exit(exit: ExitInfo) -> Self {
        match exit.cause {
            ExitCause::Stopped => TerminationCause::UserStopped,
            ExitCause::Signaled(signal) => TerminationCause::Signaled { signal },
            ExitCause::Exited | ExitCause::WaitFailed => TerminationCause::Exited {
                exit_code: exit.code.map(i64::from),
            },
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Exited {
                exit_code: Some(code),
            } => write!(f, "program exited with code {code}"),
            TerminationCause::Exited { exit_code: None } => write!(f, "program exited"),
            TerminationCause::Signaled { signal } => {
                write!(f, "program killed by signal {signal}")
            }
            TerminationCause::ConnectionLost { reason } => {
                write!(f, "debug adapter connection lost: {reason}")
            }
            TerminationCause::UserStopped => write!(f, "stopped by user"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Continue,
    Next,
    StepIn,
    StepOut,
}

impl StepKind {
    pub fn command(self) -> &'static str {
        match self {
            StepKind::Continue => "continue",
            StepKind::Next => "next",
            StepKind::StepIn => "stepIn",
            StepKind::StepOut => "stepOut",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: RunState,
    pub generation: Generation,
    /// Thread of the most recent `stopped` event.
    pub active_thread: Option<i64>,
    pub stop_reason: Option<String>,
    pub termination: Option<TerminationCause>,
}

impl SessionStatus {
    fn launching() -> Self {
        Self {
            state: RunState::Launching,
            generation: Generation::default(),
            active_thread: None,
            stop_reason: None,
            termination: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    Stopped {
        reason: String,
        thread_id: Option<i64>,
        generation: Generation,
    },
    Continued {
        thread_id: Option<i64>,
    },
    Output {
        category: Option<String>,
        output: String,
    },
    Thread {
        reason: String,
        thread_id: i64,
    },
    /// Always the last event of a session.
    Terminated(TerminationCause),
}

enum Command {
    Resume {
        kind: StepKind,
        thread_id: i64,
        reply: oneshot::Sender<DebugResult<()>>,
    },
    ResumeRejected {
        epoch: u64,
        error: DebugError,
        reply: oneshot::Sender<DebugResult<()>>,
    },
    Configured,
    DebuggeeExited(ExitInfo),
    Stopping(oneshot::Sender<()>),
    Terminate(TerminationCause, oneshot::Sender<()>),
}

struct Shared {
    id: SessionId,
    conn: DapConnection,
    tree: InspectionTree<DapConnection>,
    threads: Mutex<BTreeMap<i64, String>>,
    // Held across the round trip so replacements reach the adapter in call
    // order.
    breakpoints: tokio::sync::Mutex<BreakpointSet>,
}

/// Handle to one debug session. Cheap to clone.
#[derive(Clone)]
pub struct DebugSession {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.shared.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl DebugSession {
    /// Spawn the session actor over an established adapter connection.
    ///
    /// The session starts in `Launching`; the adapter's `initialized` event
    /// moves it to `Configuring`.
    pub fn start(
        conn: DapConnection,
        conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<DebugEvent>) {
        let shared = Arc::new(Shared {
            id: SessionId::next(),
            tree: InspectionTree::new(conn.clone()),
            conn,
            threads: Mutex::new(BTreeMap::new()),
            breakpoints: tokio::sync::Mutex::new(BreakpointSet::new()),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::launching());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            shared: shared.clone(),
            commands: commands_tx.clone(),
            status: SessionStatus::launching(),
            status_tx,
            events: events_tx,
            epoch: 0,
            stopping: false,
        };
        tokio::spawn(actor.run(commands_rx, conn_events));
        tracing::debug!(target: "pyra.session", session = %shared.id, "debug session started");

        (
            Self {
                shared,
                commands: commands_tx,
                status: status_rx,
            },
            events_rx,
        )
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn connection(&self) -> &DapConnection {
        &self.shared.conn
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the session reaches `state`. Fails with
    /// `SessionTerminated` if it terminates first.
    pub async fn wait_for_state(&self, state: RunState) -> DebugResult<SessionStatus> {
        let mut rx = self.status.clone();
        let reached = rx
            .wait_for(|status| status.state == state || status.state == RunState::Terminated)
            .await
            .map(|status| status.clone());
        let status = match reached {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        };
        if status.state == state {
            Ok(status)
        } else {
            Err(DebugError::SessionTerminated)
        }
    }

    pub async fn continue_(&self, thread_id: i64) -> DebugResult<()> {
        self.resume(StepKind::Continue, thread_id).await
    }

    pub async fn step_over(&self, thread_id: i64) -> DebugResult<()> {
        self.resume(StepKind::Next, thread_id).await
    }

    pub async fn step_into(&self, thread_id: i64) -> DebugResult<()> {
        self.resume(StepKind::StepIn, thread_id).await
    }

    pub async fn step_out(&self, thread_id: i64) -> DebugResult<()> {
        self.resume(StepKind::StepOut, thread_id).await
    }

    /// Resume or step `thread_id`. Local state moves to `Running` before the
    /// adapter answers; the next `stopped` event is authoritative. A no-op on
    /// a terminated session.
    pub async fn resume(&self, kind: StepKind, thread_id: i64) -> DebugResult<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Resume {
                kind,
                thread_id,
                reply,
            })
            .is_err()
        {
            // The actor only exits once the session has terminated.
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Ask the adapter to suspend `thread_id`. State changes once the adapter
    /// reports `stopped`.
    pub async fn pause(&self, thread_id: i64) -> DebugResult<()> {
        self.ensure_live()?;
        self.shared
            .conn
            .request("pause", ThreadArguments { thread_id })
            .await?;
        Ok(())
    }

    /// Replace every breakpoint in `path` with `lines` and return the lines
    /// the adapter verified. The recorded set is left untouched if the
    /// adapter does not accept the request.
    pub async fn set_breakpoints(
        &self,
        path: &Path,
        lines: BTreeSet<i64>,
    ) -> DebugResult<BTreeSet<i64>> {
        self.ensure_live()?;
        let mut breakpoints = self.shared.breakpoints.lock().await;
        let body: SetBreakpointsResponseBody = self
            .shared
            .conn
            .request_body("setBreakpoints", set_breakpoints_arguments(path, &lines))
            .await?;
        let verified = breakpoints.commit(path, lines, body.breakpoints);
        tracing::debug!(
            target: "pyra.session",
            session = %self.shared.id,
            path = %path.display(),
            verified = verified.len(),
            "breakpoints installed"
        );
        Ok(verified)
    }

    pub async fn breakpoints(&self) -> BreakpointSet {
        self.shared.breakpoints.lock().await.clone()
    }

    pub async fn configuration_done(&self) -> DebugResult<()> {
        self.ensure_live()?;
        self.shared
            .conn
            .request("configurationDone", Value::Null)
            .await?;
        let _ = self.commands.send(Command::Configured);
        Ok(())
    }

    pub async fn stack_trace(&self, thread_id: i64) -> DebugResult<Vec<StackFrame>> {
        self.shared.tree.stack_trace(thread_id).await
    }

    pub async fn scopes(&self, frame: FrameRef) -> DebugResult<Vec<Scope>> {
        self.shared.tree.scopes(frame).await
    }

    pub async fn variables(&self, reference: VarRef) -> DebugResult<Vec<Variable>> {
        self.shared.tree.variables(reference).await
    }

    /// Fetch the adapter's thread list and refresh the local thread table.
    pub async fn threads(&self) -> DebugResult<BTreeMap<i64, String>> {
        self.ensure_live()?;
        let body: ThreadsResponseBody = self.shared.conn.request_body("threads", Value::Null).await?;
        let threads: BTreeMap<i64, String> = body
            .threads
            .into_iter()
            .map(|thread| (thread.id, thread.name))
            .collect();
        *self.shared.threads.lock() = threads.clone();
        Ok(threads)
    }

    /// Threads seen through `thread` events and the last `threads` request.
    pub fn known_threads(&self) -> BTreeMap<i64, String> {
        self.shared.threads.lock().clone()
    }

    /// Feed the debuggee's exit into the session.
    pub fn notify_debuggee_exited(&self, exit: ExitInfo) {
        let _ = self.commands.send(Command::DebuggeeExited(exit));
    }

    /// Ask the adapter to end the debuggee, then terminate the session as
    /// user-stopped whether or not the adapter answered.
    pub async fn disconnect(&self) -> DebugResult<()> {
        if self.status.borrow().state == RunState::Terminated {
            return Ok(());
        }
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Stopping(ack)).is_err() {
            return Ok(());
        }
        let _ = done.await;

        let result = self
            .shared
            .conn
            .request(
                "disconnect",
                DisconnectArguments {
                    terminate_debuggee: true,
                },
            )
            .await;
        match result {
            Ok(_) | Err(DebugError::SessionTerminated) => {}
            Err(err) => {
                tracing::debug!(target: "pyra.session", session = %self.shared.id, error = %err, "disconnect request failed")
            }
        }

        self.terminate(TerminationCause::UserStopped).await;
        Ok(())
    }

    async fn terminate(&self, cause: TerminationCause) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Terminate(cause, ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn ensure_live(&self) -> DebugResult<()> {
        if self.status.borrow().state == RunState::Terminated {
            return Err(DebugError::SessionTerminated);
        }
        Ok(())
    }
}

struct Actor {
    shared: Arc<Shared>,
    // Used by resume tasks to report rejections back.
    commands: mpsc::UnboundedSender<Command>,
    status: SessionStatus,
    status_tx: watch::Sender<SessionStatus>,
    events: mpsc::UnboundedSender<DebugEvent>,
    /// Bumped on every adapter event and state change.
    epoch: u64,
    /// Set once a disconnect is under way; any termination is then user-driven.
    stopping: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let mut conn_open = true;
        while self.status.state != RunState::Terminated {
            tokio::select! {
                biased;
                event = conn_events.recv(), if conn_open => match event {
                    Some(ConnectionEvent::Event(event)) => self.on_event(event),
                    Some(ConnectionEvent::Closed(reason)) => self.on_closed(reason),
                    None => {
                        conn_open = false;
                        self.on_closed(CloseReason::Eof);
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        tracing::trace!(target: "pyra.session", session = %self.shared.id, "session actor exiting");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Resume {
                kind,
                thread_id,
                reply,
            } => self.resume(kind, thread_id, reply),
            Command::ResumeRejected {
                epoch,
                error,
                reply,
            } => {
                if epoch == self.epoch && self.status.state == RunState::Running {
                    tracing::debug!(
                        target: "pyra.session",
                        session = %self.shared.id,
                        error = %error,
                        "resume failed; back to paused"
                    );
                    self.transition(RunState::Paused, true);
                }
                let _ = reply.send(Err(error));
            }
            Command::Configured => {
                if self.status.state == RunState::Configuring {
                    self.transition(RunState::Running, false);
                }
            }
            Command::DebuggeeExited(exit) => self.terminate(TerminationCause::from_exit(exit)),
            Command::Stopping(ack) => {
                self.stopping = true;
                let _ = ack.send(());
            }
            Command::Terminate(cause, ack) => {
                self.terminate(cause);
                let _ = ack.send(());
            }
        }
    }

    fn resume(&mut self, kind: StepKind, thread_id: i64, reply: oneshot::Sender<DebugResult<()>>) {
        match self.status.state {
            RunState::Terminated => {
                let _ = reply.send(Ok(()));
                return;
            }
            RunState::Paused => {}
            _ => {
                let _ = reply.send(Err(DebugError::NotPaused));
                return;
            }
        }

        // Queue the request before anything else can reach the actor so the
        // wire order matches the state change.
        let pending = match serde_json::to_value(ThreadArguments { thread_id })
            .map_err(DebugError::from)
            .and_then(|arguments| self.shared.conn.send_request(kind.command(), arguments))
        {
            Ok(pending) => pending,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        self.transition(RunState::Running, false);
        let epoch = self.epoch;

        // A rejected or unanswered resume leaves the debuggee where it was.
        let commands = self.commands.clone();
        tokio::spawn(async move {
            match pending.response().await {
                Err(error @ (DebugError::AdapterRejected { .. } | DebugError::Timeout { .. })) => {
                    let rejected = Command::ResumeRejected {
                        epoch,
                        error,
                        reply,
                    };
                    if let Err(mpsc::error::SendError(Command::ResumeRejected {
                        error, reply, ..
                    })) = commands.send(rejected)
                    {
                        let _ = reply.send(Err(error));
                    }
                }
                result => {
                    let _ = reply.send(result.map(|_| ()));
                }
            }
        });
    }

    fn on_event(&mut self, event: Event) {
        self.epoch += 1;
        let Event {
            event: name, body, ..
        } = event;
        match name.as_str() {
            "initialized" => {
                if self.status.state == RunState::Launching {
                    self.transition(RunState::Configuring, false);
                }
            }
            "stopped" => {
                let body: StoppedEventBody = event_body(&name, body);
                self.status.active_thread = body.thread_id.or(self.status.active_thread);
                self.status.stop_reason = Some(body.reason.clone());
                self.transition(RunState::Paused, true);
                tracing::debug!(
                    target: "pyra.session",
                    session = %self.shared.id,
                    reason = %body.reason,
                    thread_id = ?body.thread_id,
                    generation = %self.status.generation,
                    "debuggee stopped"
                );
                self.emit(DebugEvent::Stopped {
                    reason: body.reason,
                    thread_id: body.thread_id,
                    generation: self.status.generation,
                });
            }
            "continued" => {
                let body: ContinuedEventBody = event_body(&name, body);
                if matches!(self.status.state, RunState::Paused | RunState::Running) {
                    self.transition(RunState::Running, false);
                }
                self.emit(DebugEvent::Continued {
                    thread_id: body.thread_id,
                });
            }
            "exited" => {
                let body: ExitedEventBody = event_body(&name, body);
                self.terminate(TerminationCause::Exited {
                    exit_code: body.exit_code,
                });
            }
            "terminated" => self.terminate(TerminationCause::Exited { exit_code: None }),
            "output" => {
                let body: OutputEventBody = event_body(&name, body);
                self.emit(DebugEvent::Output {
                    category: body.category,
                    output: body.output,
                });
            }
            "thread" => {
                let body: ThreadEventBody = event_body(&name, body);
                {
                    let mut threads = self.shared.threads.lock();
                    match body.reason.as_str() {
                        "exited" => {
                            threads.remove(&body.thread_id);
                        }
                        _ => {
                            threads
                                .entry(body.thread_id)
                                .or_insert_with(|| format!("Thread {}", body.thread_id));
                        }
                    }
                }
                self.emit(DebugEvent::Thread {
                    reason: body.reason,
                    thread_id: body.thread_id,
                });
            }
            other => {
                tracing::trace!(target: "pyra.session", session = %self.shared.id, event = other, "ignoring adapter event")
            }
        }
    }

    fn on_closed(&mut self, reason: CloseReason) {
        self.terminate(TerminationCause::ConnectionLost { reason });
    }

    fn transition(&mut self, state: RunState, paused: bool) {
        self.epoch += 1;
        self.status.state = state;
        self.status.generation = self.shared.tree.advance(paused);
        self.publish();
    }

    fn terminate(&mut self, cause: TerminationCause) {
        if self.status.state == RunState::Terminated {
            return;
        }
        let cause = if self.stopping {
            TerminationCause::UserStopped
        } else {
            cause
        };
        self.epoch += 1;
        self.status.state = RunState::Terminated;
        self.status.generation = self.shared.tree.close();
        self.status.termination = Some(cause.clone());
        self.publish();
        // Fails every request still waiting on the adapter.
        self.shared.conn.shutdown();
        tracing::info!(target: "pyra.session", session = %self.shared.id, cause = %cause, "debug session terminated");
        self.emit(DebugEvent::Terminated(cause));
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn emit(&self, event: DebugEvent) {
        let _ = self.events.send(event);
    }
}

fn event_body<T: DeserializeOwned + Default>(name: &str, body: Option<Value>) -> T {
    match parse_body(name, body) {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(target: "pyra.session", event = name, error = %err, "malformed event body");
            T::default()
        }
    }
}
