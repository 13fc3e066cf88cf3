//! App-server JSON-RPC client.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::codec::{
    self, InboundFrame, RequestId, RequestIdAllocator, RpcError, ServerNotification,
    ServerRequest,
};
use crate::process::{ProcessConfig, ProcessHandle, SpawnError, WriteError};
use crate::types::*;

pub const SUPPORTED_CLIENT_REQUEST_METHODS: &[&str] = &[
    "initialize",
    "thread/start",
    "thread/resume",
    "thread/list",
    "turn/start",
    "turn/interrupt",
    "model/list",
];

pub const SUPPORTED_SERVER_NOTIFICATION_METHODS: &[&str] = &[
    "error",
    "thread/started",
    "thread/status/changed",
    "thread/tokenUsage/updated",
    "turn/started",
    "turn/completed",
    "turn/diff/updated",
    "turn/plan/updated",
    "item/started",
    "item/completed",
    "item/agentMessage/delta",
    "item/plan/delta",
    "item/commandExecution/outputDelta",
    "item/fileChange/outputDelta",
    "item/reasoning/summaryTextDelta",
    "item/reasoning/textDelta",
];

pub const SUPPORTED_SERVER_REQUEST_METHODS: &[&str] = &[
    "item/commandExecution/requestApproval",
    "item/fileChange/requestApproval",
];

/// Consecutive undecodable lines tolerated before the transport gives up.
pub const DEFAULT_MAX_CONSECUTIVE_MALFORMED: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("app-server frame encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("app-server write failed: {0}")]
    Io(#[source] io::Error),
    #[error("app-server connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("app-server {method} response parse failed: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("app-server {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },
}

impl ClientError {
    /// True when the error means the backend is gone rather than that one
    /// request failed.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::Write(WriteError::ProcessExited)
        ) || matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::BrokenPipe)
    }
}

/// Why the reader loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The server closed its stdout.
    Closed,
    /// Reading stdout failed.
    Read(String),
    /// Too many undecodable lines in a row.
    MalformedLimit { consecutive: usize },
}

/// Non-protocol output worth surfacing to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportDiagnostic {
    Stderr(String),
    MalformedFrame { error: String, raw: String },
}

pub struct AppServerChannels {
    pub notifications: mpsc::Receiver<ServerNotification>,
    pub requests: mpsc::Receiver<ServerRequest>,
    pub diagnostics: mpsc::Receiver<TransportDiagnostic>,
    /// Resolves once when the reader loop stops.
    pub closed: oneshot::Receiver<TransportFailure>,
}

pub struct AppServerConfig {
    pub process: ProcessConfig,
    pub wire_log: Option<AppServerWireLog>,
    pub max_consecutive_malformed: usize,
    /// How long a request may wait for its response. `None` waits until the
    /// connection closes.
    pub request_timeout: Option<Duration>,
}

impl AppServerConfig {
    #[must_use]
    pub fn new(process: ProcessConfig) -> Self {
        Self {
            process,
            wire_log: None,
            max_consecutive_malformed: DEFAULT_MAX_CONSECUTIVE_MALFORMED,
            request_timeout: None,
        }
    }
}

/// Appends every frame that crosses the transport to a JSONL file.
///
/// Frames logged before a path is set are held in memory and flushed when
/// the file opens.
#[derive(Clone)]
pub struct AppServerWireLog {
    tx: mpsc::UnboundedSender<WireLogCommand>,
}

enum WireLogCommand {
    SetPath(PathBuf),
    Frame(WireFrame),
}

#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum WireDirection {
    In,
    Out,
}

#[derive(Serialize)]
struct WireFrame {
    timestamp_ms: u64,
    direction: WireDirection,
    raw: String,
}

#[derive(Default)]
struct WireLogSink {
    file: Option<tokio::fs::File>,
    pending: Vec<String>,
}

impl WireLogSink {
    async fn open(&mut self, path: &std::path::Path) {
        if let Some(parent) = path.parent()
            && let Err(error) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(%error, path = %parent.display(), "Could not create wire log directory");
        }
        let opened = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await;
        match opened {
            Ok(file) => {
                self.file = Some(file);
                let pending = std::mem::take(&mut self.pending);
                for line in pending {
                    self.append(line).await;
                }
            }
            Err(error) => {
                tracing::warn!(%error, path = %path.display(), "Could not open wire log");
            }
        }
    }

    async fn append(&mut self, mut line: String) {
        let Some(file) = self.file.as_mut() else {
            self.pending.push(line);
            return;
        };
        line.push('\n');
        if let Err(error) = file.write_all(line.as_bytes()).await {
            tracing::warn!(%error, "Wire log write failed, closing it");
            self.file = None;
            return;
        }
        let _ = file.flush().await;
    }
}

impl AppServerWireLog {
    /// Spawns the writer task, so this must run inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut sink = WireLogSink::default();
            while let Some(command) = rx.recv().await {
                match command {
                    WireLogCommand::SetPath(path) => sink.open(&path).await,
                    WireLogCommand::Frame(frame) => match serde_json::to_string(&frame) {
                        Ok(line) => sink.append(line).await,
                        Err(error) => tracing::debug!(%error, "Dropping unserializable wire frame"),
                    },
                }
            }
        });
        Self { tx }
    }

    pub fn set_path(&self, path: PathBuf) {
        let _ = self.tx.send(WireLogCommand::SetPath(path));
    }

    fn record(&self, direction: WireDirection, raw: &str) {
        let _ = self.tx.send(WireLogCommand::Frame(WireFrame {
            timestamp_ms: current_timestamp_ms(),
            direction,
            raw: raw.trim_end().to_string(),
        }));
    }

    fn log_inbound(&self, raw: &str) {
        self.record(WireDirection::In, raw);
    }

    fn log_outbound(&self, raw: &str) {
        self.record(WireDirection::Out, raw);
    }
}

impl Default for AppServerWireLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AppServerWireLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServerWireLog").finish_non_exhaustive()
    }
}

type PendingRequest = oneshot::Sender<Result<Value, ClientError>>;
type PendingRequests = HashMap<RequestId, PendingRequest>;
type AppServerWriter = Box<dyn AsyncWrite + Send + Unpin>;
type AppServerReader = Box<dyn AsyncRead + Send + Unpin>;

/// Where outbound lines go: a supervised child process or plain async I/O.
enum FrameSink {
    Process(Arc<ProcessHandle>),
    Writer(Mutex<AppServerWriter>),
}

impl FrameSink {
    async fn send_line(&self, line: &str) -> Result<(), ClientError> {
        match self {
            Self::Process(process) => process.write(line.as_bytes()).await.map_err(Into::into),
            Self::Writer(writer) => {
                let mut writer = writer.lock().await;
                writer
                    .write_all(line.as_bytes())
                    .await
                    .map_err(ClientError::Io)?;
                writer.flush().await.map_err(ClientError::Io)
            }
        }
    }
}

struct AppServerTransport {
    sink: FrameSink,
    pending_requests: Arc<Mutex<PendingRequests>>,
    ids: RequestIdAllocator,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    wire_log: Option<AppServerWireLog>,
    request_timeout: Option<Duration>,
}

impl AppServerTransport {
    fn new(
        sink: FrameSink,
        stdout: AppServerReader,
        wire_log: Option<AppServerWireLog>,
        max_consecutive_malformed: usize,
    ) -> (Self, AppServerChannels, mpsc::Sender<TransportDiagnostic>) {
        let pending_requests: Arc<Mutex<PendingRequests>> =
            Arc::new(Mutex::new(PendingRequests::new()));
        let (notification_tx, notification_rx) = mpsc::channel(256);
        let (request_tx, request_rx) = mpsc::channel(64);
        let (diagnostic_tx, diagnostic_rx) = mpsc::channel(256);
        let (closed_tx, closed_rx) = oneshot::channel();

        let reader_task = tokio::spawn(read_frames(
            stdout,
            ReaderRoutes {
                pending: pending_requests.clone(),
                notifications: notification_tx,
                requests: request_tx,
                diagnostics: diagnostic_tx.clone(),
                wire_log: wire_log.clone(),
                max_consecutive_malformed,
            },
            closed_tx,
        ));

        (
            Self {
                sink,
                pending_requests,
                ids: RequestIdAllocator::new(),
                reader_task: Some(reader_task),
                wire_log,
                request_timeout: None,
            },
            AppServerChannels {
                notifications: notification_rx,
                requests: request_rx,
                diagnostics: diagnostic_rx,
                closed: closed_rx,
            },
            diagnostic_tx,
        )
    }

    async fn request<T, R>(&self, method: &str, params: Option<&T>) -> Result<R, ClientError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.request_within(method, params, self.request_timeout)
            .await
    }

    async fn request_within<T, R>(
        &self,
        method: &str,
        params: Option<&T>,
        timeout: Option<Duration>,
    ) -> Result<R, ClientError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        let line = codec::encode_request(&id, method, params).map_err(ClientError::Encode)?;

        self.pending_requests.lock().await.insert(id.clone(), tx);
        if let Err(err) = self.send_line(&line).await {
            self.pending_requests.lock().await.remove(&id);
            return Err(err);
        }

        let outcome = match timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending_requests.lock().await.remove(&id);
                    tracing::warn!(%id, method, ?after, "App-server request timed out");
                    return Err(ClientError::Timeout {
                        method: method.to_string(),
                        after,
                    });
                }
            },
            None => rx.await,
        };
        let result = outcome.map_err(|_| ClientError::ConnectionClosed)??;
        serde_json::from_value(result).map_err(|source| ClientError::Decode {
            method: method.to_string(),
            source,
        })
    }

    async fn notify<T>(&self, method: &str, params: Option<&T>) -> Result<(), ClientError>
    where
        T: Serialize,
    {
        let line = codec::encode_notification(method, params).map_err(ClientError::Encode)?;
        self.send_line(&line).await
    }

    async fn respond<T>(&self, id: &RequestId, result: &T) -> Result<(), ClientError>
    where
        T: Serialize,
    {
        let line = codec::encode_response(id, result).map_err(ClientError::Encode)?;
        self.send_line(&line).await
    }

    async fn respond_error(&self, id: &RequestId, error: &RpcError) -> Result<(), ClientError> {
        let line = codec::encode_error_response(id, error).map_err(ClientError::Encode)?;
        self.send_line(&line).await
    }

    async fn send_line(&self, line: &str) -> Result<(), ClientError> {
        if let Some(log) = &self.wire_log {
            log.log_outbound(line);
        }
        self.sink.send_line(line).await
    }

}

impl Drop for AppServerTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

struct ReaderRoutes {
    pending: Arc<Mutex<PendingRequests>>,
    notifications: mpsc::Sender<ServerNotification>,
    requests: mpsc::Sender<ServerRequest>,
    diagnostics: mpsc::Sender<TransportDiagnostic>,
    wire_log: Option<AppServerWireLog>,
    max_consecutive_malformed: usize,
}

async fn read_frames(
    stdout: AppServerReader,
    routes: ReaderRoutes,
    closed_tx: oneshot::Sender<TransportFailure>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut consecutive_malformed = 0usize;

    let failure = loop {
        // Invalid UTF-8 becomes replacement characters and then fails to
        // decode like any other malformed line.
        let line = match codec::read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break TransportFailure::Closed,
            Err(err) => break TransportFailure::Read(err.to_string()),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(log) = &routes.wire_log {
            log.log_inbound(trimmed);
        }

        let frame = match codec::decode_frame(trimmed) {
            Ok(frame) => {
                consecutive_malformed = 0;
                frame
            }
            Err(err) => {
                consecutive_malformed += 1;
                tracing::warn!(error = %err, line = %trimmed, consecutive_malformed, "App-server frame decode failed");
                let _ = routes
                    .diagnostics
                    .send(TransportDiagnostic::MalformedFrame {
                        error: err.to_string(),
                        raw: trimmed.to_string(),
                    })
                    .await;
                if consecutive_malformed > routes.max_consecutive_malformed {
                    break TransportFailure::MalformedLimit {
                        consecutive: consecutive_malformed,
                    };
                }
                continue;
            }
        };

        match frame {
            InboundFrame::Response { id, outcome } => {
                let sender = routes.pending.lock().await.remove(&id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(outcome.map_err(ClientError::Rpc));
                    }
                    None => {
                        tracing::warn!(%id, "App-server response without pending request");
                    }
                }
            }
            InboundFrame::Notification(notification) => {
                if routes.notifications.send(notification).await.is_err() {
                    tracing::debug!("App-server notification receiver dropped");
                }
            }
            InboundFrame::ServerRequest(request) => {
                if routes.requests.send(request).await.is_err() {
                    tracing::debug!("App-server request receiver dropped");
                }
            }
        }
    };

    tracing::debug!(?failure, "App-server reader stopped");
    let mut pending = routes.pending.lock().await;
    for (_, sender) in pending.drain() {
        let _ = sender.send(Err(ClientError::ConnectionClosed));
    }
    drop(pending);
    let _ = closed_tx.send(failure);
}

pub struct AppServerClient {
    transport: AppServerTransport,
    process: Option<Arc<ProcessHandle>>,
}

impl AppServerClient {
    /// Spawn the backend and attach the transport to its standard streams.
    /// Stderr lines are forwarded as [`TransportDiagnostic::Stderr`].
    pub fn spawn(config: AppServerConfig) -> Result<(Self, AppServerChannels), SpawnError> {
        let (process, output) = ProcessHandle::spawn(config.process)?;
        let process = Arc::new(process);

        let (mut transport, channels, diagnostic_tx) = AppServerTransport::new(
            FrameSink::Process(process.clone()),
            Box::new(output.stdout),
            config.wire_log,
            config.max_consecutive_malformed,
        );
        transport.request_timeout = config.request_timeout;

        tokio::spawn(async move {
            let mut reader = BufReader::new(output.stderr);
            let mut buf = Vec::new();
            while let Ok(Some(line)) = codec::read_line_lossy(&mut reader, &mut buf).await {
                if line.trim().is_empty() {
                    continue;
                }
                if diagnostic_tx
                    .send(TransportDiagnostic::Stderr(line))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok((
            Self {
                transport,
                process: Some(process),
            },
            channels,
        ))
    }

    /// Attach to arbitrary I/O. Used for in-process servers and tests.
    pub fn connect_with_io(
        stdin: AppServerWriter,
        stdout: AppServerReader,
        wire_log: Option<AppServerWireLog>,
        max_consecutive_malformed: usize,
    ) -> (Self, AppServerChannels) {
        let (transport, channels, _diagnostic_tx) = AppServerTransport::new(
            FrameSink::Writer(Mutex::new(stdin)),
            stdout,
            wire_log,
            max_consecutive_malformed,
        );
        (
            Self {
                transport,
                process: None,
            },
            channels,
        )
    }

    /// Fail requests that get no response within `timeout`.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.transport.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn process(&self) -> Option<&Arc<ProcessHandle>> {
        self.process.as_ref()
    }

    /// Send `initialize` followed by the `initialized` notification.
    /// A server that reports it is already initialized is treated as ready.
    /// The request timeout does not apply; callers bound the handshake.
    pub async fn initialize<T>(&self, params: T) -> Result<InitializeResponse, ClientError>
    where
        T: Into<InitializeParams>,
    {
        let params = params.into();
        let response = match self
            .transport
            .request_within::<_, Value>("initialize", Some(&params), None)
            .await
        {
            Ok(value) => serde_json::from_value(value).unwrap_or_else(|err| {
                tracing::debug!(error = %err, "App-server initialize result not recognized");
                InitializeResponse::default()
            }),
            Err(ClientError::Rpc(err)) if err.message.contains("Already initialized") => {
                tracing::debug!("App-server already initialized");
                InitializeResponse::default()
            }
            Err(err) => return Err(err),
        };
        self.transport
            .notify::<Value>("initialized", None)
            .await?;
        Ok(response)
    }

    pub async fn thread_list(
        &self,
        params: ThreadListParams,
    ) -> Result<ThreadListResponse, ClientError> {
        self.transport.request("thread/list", Some(&params)).await
    }

    pub async fn model_list(&self, params: ModelListParams) -> Result<ModelListResponse, ClientError> {
        self.transport.request("model/list", Some(&params)).await
    }

    pub async fn turn_interrupt(
        &self,
        params: TurnInterruptParams,
    ) -> Result<TurnInterruptResponse, ClientError> {
        self.transport.request("turn/interrupt", Some(&params)).await
    }

    /// Send an arbitrary request and decode the result.
    pub async fn request<T, R>(&self, method: &str, params: Option<&T>) -> Result<R, ClientError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.transport.request(method, params).await
    }

    pub async fn notify<T>(&self, method: &str, params: Option<&T>) -> Result<(), ClientError>
    where
        T: Serialize,
    {
        self.transport.notify(method, params).await
    }

    pub async fn respond<T>(&self, id: &RequestId, result: &T) -> Result<(), ClientError>
    where
        T: Serialize,
    {
        self.transport.respond(id, result).await
    }

    pub async fn respond_error(&self, id: &RequestId, error: &RpcError) -> Result<(), ClientError> {
        self.transport.respond_error(id, error).await
    }
}

fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
