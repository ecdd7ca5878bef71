//! Shared fixtures for the integration suite.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use pyra_config::PyraConfig;
use pyra_dap::client::{ConnectionConfig, DapConnection};
use pyra_dap::dap::messages::{Event, ProtocolMessage, Request, Response};
use pyra_dap::dap_tokio::{DapReader, DapWriter};
use pyra_dap::launch::handshake;
use pyra_dap::router::{RouterEvent, Subscription};
use pyra_dap::session::{DebugEvent, DebugSession};
use pyra_dap::types::LaunchArguments;
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Reference of the `Locals` scope of every frame.
pub const LOCALS_REF: i64 = 42;
pub const ITEMS_REF: i64 = 43;
pub const CONFIG_REF: i64 = 44;

pub const PROGRAM: &str = "/work/app.py";

#[derive(Clone, Debug)]
pub struct MockAdapterConfig {
    /// Breakpoint lines answered with `verified: false`.
    pub unverified_lines: BTreeSet<i64>,
    /// Commands answered with an error response.
    pub reject_commands: BTreeSet<String>,
    /// Commands recorded but never answered.
    pub silent_commands: BTreeSet<String>,
    /// Delay before answering `variables`; other requests keep being served.
    pub variables_delay: Duration,
    /// Exit code reported once the program runs to completion.
    pub exit_code: i64,
}

impl Default for MockAdapterConfig {
    fn default() -> Self {
        Self {
            unverified_lines: BTreeSet::new(),
            reject_commands: BTreeSet::new(),
            silent_commands: BTreeSet::new(),
            variables_delay: Duration::ZERO,
            exit_code: 0,
        }
    }
}

/// A scripted debug adapter speaking just enough DAP for the session tests.
///
/// The simulated program stops at the first breakpoint after
/// `configurationDone`, moves one line per step and runs to completion on
/// `continue`.
pub struct MockAdapter {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

impl MockAdapter {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockAdapterConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockAdapterConfig) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State::new(config));

        let task_state = state.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else { break };
                tokio::spawn(serve(stream, task_state.clone(), task_shutdown.clone()));
            }
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().clone()
    }

    pub fn request_count(&self, command: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|request| request.command == command)
            .count()
    }

    /// Number of `variables` requests made for `reference`.
    pub fn variables_requests(&self, reference: i64) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|request| {
                request.command == "variables"
                    && request.arguments["variablesReference"].as_i64() == Some(reference)
            })
            .count()
    }

    pub async fn wait_for_request(&self, command: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.request_count(command) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("adapter never received `{command}`"));
    }

    pub fn send_event(&self, event: &str, body: Value) {
        let event = self.state.event(event, body);
        self.state.send(Outgoing::Message(event));
    }

    /// Write bytes to the client exactly as given.
    pub fn send_raw(&self, bytes: &[u8]) {
        self.state.send(Outgoing::Raw(bytes.to_vec()));
    }

    /// A response whose `request_seq` was never issued by the client.
    pub fn send_orphan_response(&self) {
        let request = Request::new(999_999, "threads", Value::Null);
        let seq = self.state.next_seq();
        self.state.send(Outgoing::Message(ProtocolMessage::Response(
            Response::success(seq, &request, Some(json!({"threads": []}))),
        )));
    }
}

impl Drop for MockAdapter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum Outgoing {
    Message(ProtocolMessage),
    Raw(Vec<u8>),
    Close,
}

struct State {
    config: MockAdapterConfig,
    next_seq: AtomicI64,
    line: AtomicI64,
    frame_base: AtomicI64,
    requests: Mutex<Vec<Request>>,
    breakpoints: Mutex<BTreeMap<String, BTreeSet<i64>>>,
    pending_launch: Mutex<Option<Request>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
}

impl State {
    fn new(config: MockAdapterConfig) -> Self {
        Self {
            config,
            next_seq: AtomicI64::new(1),
            line: AtomicI64::new(1),
            frame_base: AtomicI64::new(0),
            requests: Mutex::new(Vec::new()),
            breakpoints: Mutex::new(BTreeMap::new()),
            pending_launch: Mutex::new(None),
            outgoing: Mutex::new(None),
        }
    }

    fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, message: Outgoing) {
        if let Some(tx) = self.outgoing.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    fn event(&self, event: &str, body: Value) -> ProtocolMessage {
        ProtocolMessage::Event(Event::new(self.next_seq(), event, Some(body)))
    }

    fn ok(&self, request: &Request, body: Value) -> ProtocolMessage {
        ProtocolMessage::Response(Response::success(self.next_seq(), request, Some(body)))
    }

    fn stop(&self, reason: &str, line: i64) -> ProtocolMessage {
        self.line.store(line, Ordering::SeqCst);
        self.frame_base.fetch_add(10, Ordering::SeqCst);
        self.event("stopped", json!({"reason": reason, "threadId": 1, "allThreadsStopped": true}))
    }

    fn finish(&self) -> Vec<Outgoing> {
        vec![
            Outgoing::Message(self.event("exited", json!({"exitCode": self.config.exit_code}))),
            Outgoing::Message(self.event("terminated", json!({}))),
        ]
    }

    /// Answer one request. The returned messages go out in order.
    fn handle(&self, request: Request) -> Vec<Outgoing> {
        self.requests.lock().push(request.clone());
        let command = request.command.as_str();
        if self.config.silent_commands.contains(command) {
            return Vec::new();
        }
        if self.config.reject_commands.contains(command) {
            let seq = self.next_seq();
            return vec![Outgoing::Message(ProtocolMessage::Response(
                Response::error(seq, &request, format!("mock adapter rejects `{command}`")),
            ))];
        }

        match command {
            "initialize" => vec![Outgoing::Message(self.ok(
                &request,
                json!({"supportsConfigurationDoneRequest": true}),
            ))],
            "launch" | "attach" => {
                *self.pending_launch.lock() = Some(request);
                vec![Outgoing::Message(self.event("initialized", json!({})))]
            }
            "setBreakpoints" => {
                let path = request.arguments["source"]["path"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned();
                let lines: BTreeSet<i64> = request.arguments["breakpoints"]
                    .as_array()
                    .map(|bps| bps.iter().filter_map(|bp| bp["line"].as_i64()).collect())
                    .unwrap_or_default();
                let breakpoints: Vec<Value> = lines
                    .iter()
                    .map(|&line| {
                        json!({
                            "id": line,
                            "verified": !self.config.unverified_lines.contains(&line),
                            "line": line,
                        })
                    })
                    .collect();
                self.breakpoints.lock().insert(path, lines);
                vec![Outgoing::Message(
                    self.ok(&request, json!({ "breakpoints": breakpoints })),
                )]
            }
            "configurationDone" => {
                let mut out = vec![Outgoing::Message(self.ok(&request, json!({})))];
                if let Some(launch) = self.pending_launch.lock().take() {
                    out.push(Outgoing::Message(self.ok(&launch, json!({}))));
                }
                out.push(Outgoing::Message(
                    self.event("thread", json!({"reason": "started", "threadId": 1})),
                ));
                let first = self
                    .breakpoints
                    .lock()
                    .values()
                    .flatten()
                    .copied()
                    .find(|line| !self.config.unverified_lines.contains(line));
                match first {
                    Some(line) => out.push(Outgoing::Message(self.stop("breakpoint", line))),
                    None => out.extend(self.finish()),
                }
                out
            }
            "threads" => vec![Outgoing::Message(self.ok(
                &request,
                json!({"threads": [{"id": 1, "name": "MainThread"}]}),
            ))],
            "stackTrace" => {
                let base = self.frame_base.load(Ordering::SeqCst);
                let line = self.line.load(Ordering::SeqCst);
                vec![Outgoing::Message(self.ok(
                    &request,
                    json!({
                        "stackFrames": [
                            {"id": base + 1, "name": "main", "source": {"name": "app.py", "path": PROGRAM}, "line": line, "column": 1},
                            {"id": base + 2, "name": "<module>", "source": {"name": "app.py", "path": PROGRAM}, "line": 20, "column": 1},
                        ],
                        "totalFrames": 2,
                    }),
                ))]
            }
            "scopes" => vec![Outgoing::Message(self.ok(
                &request,
                json!({"scopes": [
                    {"name": "Locals", "variablesReference": LOCALS_REF, "expensive": false},
                    {"name": "Globals", "variablesReference": 0, "expensive": true},
                ]}),
            ))],
            "variables" => {
                let reference = request.arguments["variablesReference"]
                    .as_i64()
                    .unwrap_or_default();
                let variables = if reference == LOCALS_REF {
                    json!([
                        {"name": "x", "value": "1", "type": "int", "variablesReference": 0},
                        {"name": "items", "value": "[1, 2]", "type": "list", "variablesReference": ITEMS_REF},
                        {"name": "config", "value": "{...}", "type": "dict", "variablesReference": CONFIG_REF},
                    ])
                } else {
                    json!([
                        {"name": format!("{reference}[0]"), "value": reference.to_string(), "type": "int", "variablesReference": 0},
                    ])
                };
                vec![Outgoing::Message(
                    self.ok(&request, json!({ "variables": variables })),
                )]
            }
            "continue" => {
                let mut out = vec![Outgoing::Message(
                    self.ok(&request, json!({"allThreadsContinued": true})),
                )];
                out.extend(self.finish());
                out
            }
            "next" | "stepIn" | "stepOut" => {
                let line = self.line.load(Ordering::SeqCst) + 1;
                vec![
                    Outgoing::Message(self.ok(&request, json!({}))),
                    Outgoing::Message(self.stop("step", line)),
                ]
            }
            "pause" => {
                let line = self.line.load(Ordering::SeqCst);
                vec![
                    Outgoing::Message(self.ok(&request, json!({}))),
                    Outgoing::Message(self.stop("pause", line)),
                ]
            }
            "disconnect" => vec![
                Outgoing::Message(self.ok(&request, json!({}))),
                Outgoing::Message(self.event("terminated", json!({}))),
                Outgoing::Close,
            ],
            _ => {
                let seq = self.next_seq();
                vec![Outgoing::Message(ProtocolMessage::Response(
                    Response::error(seq, &request, "unsupported request"),
                ))]
            }
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<State>, shutdown: CancellationToken) {
    let (read, write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    *state.outgoing.lock() = Some(tx.clone());

    tokio::spawn(async move {
        let mut writer = DapWriter::new(write);
        while let Some(out) = rx.recv().await {
            let written = match out {
                Outgoing::Message(message) => writer.write_message(&message).await,
                Outgoing::Raw(bytes) => writer.write_raw(&bytes).await,
                // Dropping the write half closes the client's read side.
                Outgoing::Close => break,
            };
            if written.is_err() {
                break;
            }
        }
    });

    let mut reader = DapReader::new(read);
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = reader.read_message() => message,
        };
        let request = match message {
            Ok(Some(ProtocolMessage::Request(request))) => request,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        };

        let delayed = request.command == "variables" && !state.config.variables_delay.is_zero();
        let replies = state.handle(request);
        if delayed {
            let tx = tx.clone();
            let delay = state.config.variables_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for reply in replies {
                    let _ = tx.send(reply);
                }
            });
        } else {
            for reply in replies {
                let _ = tx.send(reply);
            }
        }
    }
    let _ = tx.send(Outgoing::Close);
}

pub fn launch_arguments() -> LaunchArguments {
    LaunchArguments {
        name: "Pyra: app.py".to_owned(),
        type_: "python".to_owned(),
        request: "launch".to_owned(),
        program: PROGRAM.to_owned(),
        cwd: "/work".to_owned(),
        console: "internalConsole".to_owned(),
        just_my_code: true,
        stop_on_entry: false,
    }
}

pub struct Attached {
    pub session: DebugSession,
    pub events: mpsc::UnboundedReceiver<DebugEvent>,
}

impl Attached {
    /// Next event, skipping thread and output noise.
    pub async fn next_event(&mut self) -> DebugEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for a debug event")
                .expect("debug event stream ended");
            match event {
                DebugEvent::Thread { .. } | DebugEvent::Output { .. } => continue,
                other => return other,
            }
        }
    }
}

/// Connect to `mock` and run the configuration handshake with `breakpoints`
/// in [`PROGRAM`].
pub async fn attach(mock: &MockAdapter, breakpoints: &[i64]) -> Attached {
    attach_with_timeout(mock, breakpoints, Duration::from_secs(2)).await
}

pub async fn attach_with_timeout(
    mock: &MockAdapter,
    breakpoints: &[i64],
    request_timeout: Duration,
) -> Attached {
    let (conn, conn_events) =
        DapConnection::connect_tcp(mock.addr(), ConnectionConfig { request_timeout })
            .await
            .expect("connect to mock adapter");
    let (session, events) = DebugSession::start(conn, conn_events);

    let mut sources = BTreeMap::new();
    if !breakpoints.is_empty() {
        sources.insert(
            PathBuf::from(PROGRAM),
            breakpoints.iter().copied().collect::<BTreeSet<i64>>(),
        );
    }
    handshake(&session, launch_arguments(), &sources)
        .await
        .expect("debug handshake");
    Attached { session, events }
}

/// Path of the helper binary standing in for the Python interpreter.
pub fn helper_interpreter() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pyra_dap_test_helper"))
}

/// Write a helper script (one directive per line) into `dir`.
pub fn write_script(dir: &Path, name: &str, directives: &[&str]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, directives.join("\n")).expect("write helper script");
    path
}

/// Config whose interpreter is the helper binary.
pub fn helper_config() -> PyraConfig {
    let mut config = PyraConfig::default();
    config.interpreter.python = Some(helper_interpreter());
    config.interpreter.stop_grace_ms = 500;
    config.debug.connect_attempts = 50;
    config.debug.connect_interval_ms = 20;
    config.debug.request_timeout_ms = 2_000;
    config
}

pub async fn next_routed(subscription: &mut Subscription) -> RouterEvent {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for a routed event")
        .expect("router closed")
}
