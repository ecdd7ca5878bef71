use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::dap::codec::sanitize_json_error_message;
use crate::dap::messages::{Event, ProtocolMessage, Request, Response};
use crate::dap_tokio::{DapError, DapReader, DapWriter};
use crate::error::{DebugError, DebugResult};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on every request's round trip.
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Why the adapter connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The adapter closed the stream between messages.
    Eof,
    /// A frame could not be decoded; the stream can no longer be trusted.
    Decode(String),
    Io(String),
    /// Closed locally through [`DapConnection::shutdown`].
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "adapter closed the connection"),
            CloseReason::Decode(message) => write!(f, "protocol decode error: {message}"),
            CloseReason::Io(message) => write!(f, "connection error: {message}"),
            CloseReason::Shutdown => write!(f, "connection shut down"),
        }
    }
}

/// Adapter-initiated traffic the connection does not handle itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Event(Event),
    /// Always the last item; sent exactly once.
    Closed(CloseReason),
}

struct Inner {
    outgoing: mpsc::UnboundedSender<ProtocolMessage>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Response>>>,
    next_seq: AtomicI64,
    orphans: AtomicU64,
    shutdown: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    config: ConnectionConfig,
}

impl Inner {
    fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Record the first close reason and stop both loops. Returns the reason
    /// that ended up recorded.
    fn close(&self, reason: CloseReason) -> CloseReason {
        let recorded = {
            let mut slot = self.close_reason.lock();
            slot.get_or_insert(reason).clone()
        };
        self.shutdown.cancel();
        recorded
    }

    fn complete(&self, response: Response) {
        let tx = self.pending.lock().remove(&response.request_seq);
        match tx {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                let count = self.orphans.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    target: "pyra.dap",
                    request_seq = response.request_seq,
                    command = %response.command,
                    orphans = count,
                    "OrphanResponse: no pending request for adapter response; dropping it"
                );
            }
        }
    }

    fn reject_reverse_request(&self, request: &Request) {
        tracing::debug!(
            target: "pyra.dap",
            command = %request.command,
            seq = request.seq,
            "rejecting reverse request"
        );
        let response = Response::error(
            self.next_seq(),
            request,
            format!("reverse request `{}` is not supported", request.command),
        );
        let _ = self.outgoing.send(ProtocolMessage::Response(response));
    }
}

/// Client side of one DAP connection.
///
/// Requests are correlated to responses by sequence number. Events and the
/// final close notification are delivered on the receiver returned next to
/// the connection.
#[derive(Clone)]
pub struct DapConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for DapConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DapConnection")
            .field("closed", &self.is_closed())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}

impl DapConnection {
    pub async fn connect_tcp(
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream, config))
    }

    pub fn from_tcp(
        stream: TcpStream,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self::from_io(reader, writer, config)
    }

    /// Start the reader and writer tasks over an arbitrary duplex stream.
    pub fn from_io<R, W>(
        reader: R,
        writer: W,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            outgoing: out_tx,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicI64::new(1),
            orphans: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            close_reason: Mutex::new(None),
            config,
        });

        tokio::spawn(write_loop(writer, out_rx, inner.clone()));
        tokio::spawn(read_loop(reader, inner.clone(), events_tx));

        (Self { inner }, events_rx)
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }

    /// Responses that arrived without a matching pending request.
    pub fn orphan_responses(&self) -> u64 {
        self.inner.orphans.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Close the connection. Pending requests fail with
    /// [`DebugError::SessionTerminated`].
    pub fn shutdown(&self) {
        self.inner.close(CloseReason::Shutdown);
    }

    /// Queue a request without waiting for its response.
    pub fn send_request(&self, command: &str, arguments: Value) -> DebugResult<PendingRequest> {
        if self.is_closed() {
            return Err(DebugError::SessionTerminated);
        }

        let seq = self.inner.next_seq();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(seq, tx);

        tracing::trace!(target: "pyra.dap", seq, command, "sending request");
        let request = ProtocolMessage::Request(Request::new(seq, command, arguments));
        if self.inner.outgoing.send(request).is_err() {
            self.inner.pending.lock().remove(&seq);
            return Err(DebugError::SessionTerminated);
        }

        Ok(PendingRequest {
            seq,
            command: command.to_owned(),
            rx,
            inner: self.inner.clone(),
        })
    }

    /// Send a request and wait for its (successful) response.
    pub async fn request(&self, command: &str, arguments: impl Serialize) -> DebugResult<Response> {
        let arguments = serde_json::to_value(arguments)?;
        self.send_request(command, arguments)?.response().await
    }

    /// Like [`DapConnection::request`] but decodes the response body.
    pub async fn request_body<T>(&self, command: &str, arguments: impl Serialize) -> DebugResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let response = self.request(command, arguments).await?;
        parse_body(command, response.body)
    }
}

pub(crate) fn parse_body<T>(command: &str, body: Option<Value>) -> DebugResult<T>
where
    T: DeserializeOwned + Default,
{
    match body {
        None | Some(Value::Null) => Ok(T::default()),
        Some(body) => serde_json::from_value(body).map_err(|err| DebugError::InvalidResponse {
            command: command.to_owned(),
            reason: sanitize_json_error_message(&err.to_string()),
        }),
    }
}

/// A request that has been sent and whose response has not been awaited yet.
pub struct PendingRequest {
    seq: i64,
    command: String,
    rx: oneshot::Receiver<Response>,
    inner: Arc<Inner>,
}

impl PendingRequest {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Wait for the response, bounded by the connection's request timeout.
    ///
    /// Error responses become [`DebugError::AdapterRejected`]. A timed-out
    /// request is forgotten; its late response is counted as an orphan.
    pub async fn response(self) -> DebugResult<Response> {
        let Self {
            seq,
            command,
            rx,
            inner,
        } = self;
        let timeout = inner.config.request_timeout;

        let response = tokio::select! {
            biased;
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(response)) => response,
                Ok(Err(_closed)) => return Err(DebugError::SessionTerminated),
                Err(_elapsed) => {
                    inner.pending.lock().remove(&seq);
                    tracing::debug!(target: "pyra.dap", seq, command = %command, ?timeout, "request timed out");
                    return Err(DebugError::Timeout { command, after: timeout });
                }
            },
            _ = inner.shutdown.cancelled() => {
                inner.pending.lock().remove(&seq);
                return Err(DebugError::SessionTerminated);
            }
        };

        if !response.success {
            return Err(DebugError::AdapterRejected {
                command,
                message: response
                    .message
                    .unwrap_or_else(|| "request failed".to_owned()),
            });
        }
        Ok(response)
    }
}

async fn write_loop<W>(writer: W, mut rx: mpsc::UnboundedReceiver<ProtocolMessage>, inner: Arc<Inner>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = DapWriter::new(writer);
    loop {
        let message = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(err) = writer.write_message(&message).await {
            tracing::warn!(target: "pyra.dap", error = %err, "failed to write to debug adapter");
            inner.close(CloseReason::Io(err.to_string()));
            break;
        }
    }
}

async fn read_loop<R>(reader: R, inner: Arc<Inner>, events: mpsc::UnboundedSender<ConnectionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = DapReader::new(reader);
    let reason = loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break CloseReason::Shutdown,
            next = reader.read_message() => next,
        };
        match next {
            Ok(Some(ProtocolMessage::Response(response))) => inner.complete(response),
            Ok(Some(ProtocolMessage::Event(event))) => {
                tracing::trace!(target: "pyra.dap", event = %event.event, "adapter event");
                let _ = events.send(ConnectionEvent::Event(event));
            }
            Ok(Some(ProtocolMessage::Request(request))) => inner.reject_reverse_request(&request),
            Ok(None) => break CloseReason::Eof,
            Err(DapError::Io(err)) => break CloseReason::Io(err.to_string()),
            Err(err) => break CloseReason::Decode(err.to_string()),
        }
    };

    let reason = inner.close(reason);
    // Dropping the senders fails every waiter with `SessionTerminated`.
    inner.pending.lock().clear();
    match &reason {
        CloseReason::Decode(message) => {
            tracing::warn!(target: "pyra.dap", error = %message, "closing adapter connection after decode error")
        }
        other => tracing::debug!(target: "pyra.dap", reason = %other, "adapter connection closed"),
    }
    let _ = events.send(ConnectionEvent::Closed(reason));
}
