//! Long-lived connection to a tool server.
//!
//! [`McpConnection`] keeps one server process alive for a whole session. The
//! capability handshake runs once in [`McpConnection::connect`]; afterwards
//! every call writes a request line to the same stdin and waits for the
//! response with the matching id. A background task reads stdout and hands
//! each response to the waiting caller. When the process goes away, every
//! outstanding call fails with [`McpError::ConnectionLost`] and the
//! connection is closed for good.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use curio_core::ServerConfig;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::client::{tools_from_result, ToolClient, DEFAULT_CALL_TIMEOUT};
use crate::error::{McpError, TransportError};
use crate::framing;
use crate::launcher::{self, ProcessHandle};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    RequestId, ServerCapabilities, ServerInfo, ToolDefinition, ToolOutput,
};

/// How long `close()` waits after SIGTERM before killing.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Connection state for a tool server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet.
    Disconnected,
    /// Process launched, handshake in progress.
    Connecting,
    /// Handshake complete; calls allowed.
    Ready,
    /// Terminal. Closed explicitly or after the server went away.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

type Reply = Result<Value, McpError>;

/// Calls waiting for a response, keyed by request id.
#[derive(Default)]
struct PendingCalls {
    /// Set once the reader has stopped; no new calls may register.
    closed: bool,
    calls: HashMap<RequestId, oneshot::Sender<Reply>>,
}

/// State shared with the stdout reader task.
struct Shared {
    name: String,
    state: Mutex<ConnectionState>,
    pending: Mutex<PendingCalls>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn register(&self, id: RequestId) -> Result<oneshot::Receiver<Reply>, McpError> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(McpError::ConnectionLost);
        }
        let (tx, rx) = oneshot::channel();
        pending.calls.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: &RequestId) {
        self.pending.lock().calls.remove(id);
    }

    /// Route one stdout line to the call it answers.
    fn dispatch(&self, line: &str) {
        let Some(response) = framing::parse_line(line) else {
            trace!(server = %self.name, line = line.trim_end(), "Skipping non-protocol output");
            return;
        };

        let sender = self.pending.lock().calls.remove(&response.id);
        match sender {
            Some(tx) => {
                debug!(server = %self.name, id = %response.id, "Received response");
                let _ = tx.send(response.into_result());
            }
            None => {
                warn!(server = %self.name, id = %response.id, "Response for unknown request");
            }
        }
    }

    /// Reject every outstanding call and refuse new ones.
    fn fail_pending(&self) {
        let calls: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            pending.calls.drain().map(|(_, tx)| tx).collect()
        };

        if !calls.is_empty() {
            debug!(server = %self.name, count = calls.len(), "Failing pending calls");
        }
        for tx in calls {
            let _ = tx.send(Err(McpError::ConnectionLost));
        }
    }

    /// Move to `Closed`, returning the previous state.
    fn mark_closed(&self) -> ConnectionState {
        std::mem::replace(&mut *self.state.lock(), ConnectionState::Closed)
    }
}

/// Live process and the tasks draining it.
struct Session {
    process: ProcessHandle,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stderr_logger: JoinHandle<()>,
}

/// A long-lived session with a single tool server process.
pub struct McpConnection {
    /// State shared with the reader task.
    shared: Arc<Shared>,
    /// Launch description.
    config: ServerConfig,
    /// Per-request timeout; `None` waits indefinitely.
    request_timeout: Option<Duration>,
    /// Live process, present between connect and close.
    session: tokio::sync::Mutex<Option<Session>>,
    /// Last issued request ID.
    request_counter: AtomicU64,
    /// Server information after initialization.
    server_info: RwLock<Option<ServerInfo>>,
    /// Server capabilities after initialization.
    server_capabilities: RwLock<Option<ServerCapabilities>>,
    /// Tools from the most recent listing.
    cached_tools: RwLock<Vec<ToolDefinition>>,
}

impl McpConnection {
    /// Create a disconnected session for `config`.
    pub fn new(name: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(ConnectionState::Disconnected),
                pending: Mutex::new(PendingCalls::default()),
            }),
            config,
            request_timeout: Some(DEFAULT_CALL_TIMEOUT),
            session: tokio::sync::Mutex::new(None),
            request_counter: AtomicU64::new(0),
            server_info: RwLock::new(None),
            server_capabilities: RwLock::new(None),
            cached_tools: RwLock::new(Vec::new()),
        }
    }

    /// Set the per-request timeout. `None` disables it.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Check if the connection is ready for use.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Server information reported during the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    /// Server capabilities reported during the handshake.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities.read().clone()
    }

    /// Tools from the most recent `list_tools` call.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.cached_tools.read().clone()
    }

    /// Generate a new request ID.
    fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Launch the server and perform the capability handshake.
    pub async fn connect(&self) -> Result<(), McpError> {
        {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(McpError::invalid_state("disconnected", *state));
            }
            *state = ConnectionState::Connecting;
        }

        info!(
            server = %self.name(),
            command = %self.config.command,
            "Connecting to tool server"
        );

        match self.open().await {
            Ok(result) => {
                let promoted = {
                    let mut state = self.shared.state.lock();
                    let connecting = *state == ConnectionState::Connecting;
                    if connecting {
                        *state = ConnectionState::Ready;
                    }
                    connecting
                };

                if !promoted {
                    // Closed underneath us while the handshake finished.
                    self.shutdown().await;
                    return Err(McpError::ConnectionLost);
                }

                info!(
                    server = %self.name(),
                    server_name = %result.server_info.name,
                    protocol_version = %result.protocol_version,
                    "Tool server connection initialized"
                );
                Ok(())
            }
            Err(e) => {
                error!(server = %self.name(), error = %e, "Failed to connect to tool server");
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<InitializeResult, McpError> {
        let mut process = launcher::launch(&self.config)?;
        let stdin = process.take_stdin()?;
        let stdout = process.take_stdout()?;
        let stderr = process.take_stderr()?;

        let reader = tokio::spawn(read_responses(Arc::clone(&self.shared), stdout));
        let stderr_logger = tokio::spawn(log_stderr(self.name().to_string(), stderr));

        *self.session.lock().await = Some(Session {
            process,
            stdin,
            reader,
            stderr_logger,
        });

        debug!(server = %self.name(), "Performing capability handshake");

        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self.request("initialize", params).await.map_err(|e| match e {
            McpError::Remote { message, .. } => McpError::init_failed(message),
            other => other,
        })?;

        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::init_failed(format!("malformed initialize result: {}", e)))?;

        *self.server_info.write() = Some(result.server_info.clone());
        *self.server_capabilities.write() = Some(result.capabilities.clone());

        self.notify("notifications/initialized").await?;

        Ok(result)
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            other => Err(McpError::invalid_state("ready", other)),
        }
    }

    /// Send a request and wait for the matching response.
    ///
    /// The request timeout covers writing the line as well as waiting for
    /// the answer.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = RequestId::from(self.next_request_id());
        let line = framing::encode_message(&JsonRpcRequest::new(id.clone(), method, params))?;

        let rx = self.shared.register(id.clone())?;

        debug!(server = %self.name(), id = %id, method = method, "Sending request");

        let mut written = false;
        let exchange = async {
            self.send_line(&line).await?;
            written = true;
            rx.await.unwrap_or(Err(McpError::ConnectionLost))
        };

        let outcome = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| limit),
            None => Ok(exchange.await),
        };

        match outcome {
            Ok(result) => {
                if !written {
                    self.shared.forget(&id);
                }
                result
            }
            Err(limit) => {
                self.shared.forget(&id);
                warn!(
                    server = %self.name(),
                    id = %id,
                    method = method,
                    timeout_ms = limit.as_millis() as u64,
                    "Request timed out"
                );

                if !written {
                    // A partial line on stdin would corrupt every later request.
                    warn!(server = %self.name(), id = %id, "Request only partly written, closing session");
                    self.shutdown().await;
                }

                Err(McpError::Timeout(limit))
            }
        }
    }

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let notification = JsonRpcNotification::<()>::new(method, None);
        let line = framing::encode_message(&notification)?;
        self.send_line(&line).await
    }

    async fn send_line(&self, line: &str) -> Result<(), McpError> {
        let mut session = self.session.lock().await;
        let session = session.as_mut().ok_or(McpError::ConnectionLost)?;

        let written = async {
            session.stdin.write_all(line.as_bytes()).await?;
            session.stdin.flush().await
        }
        .await;

        written.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => McpError::ConnectionLost,
            _ => McpError::Transport(TransportError::WriteError(e)),
        })
    }

    /// List available tools from the server.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        self.ensure_ready()?;

        debug!(server = %self.name(), "Listing tools");

        let tools = tools_from_result(self.request("tools/list", json!({})).await?)?;
        *self.cached_tools.write() = tools.clone();

        debug!(server = %self.name(), tool_count = tools.len(), "Listed tools");

        Ok(tools)
    }

    /// Call a tool on the server.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        self.ensure_ready()?;

        debug!(server = %self.name(), tool = name, "Calling tool");

        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;

        let output = ToolOutput::new(self.request("tools/call", params).await?);

        if output.is_error() {
            warn!(server = %self.name(), tool = name, "Tool returned error");
        }

        Ok(output)
    }

    /// Terminate the server process and close the connection.
    pub async fn close(&self) -> Result<(), McpError> {
        let previous = {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Disconnected => {
                    return Err(McpError::invalid_state("connecting or ready", *state));
                }
                previous => {
                    *state = ConnectionState::Closed;
                    previous
                }
            }
        };

        if previous == ConnectionState::Closed {
            // The server went away on its own; still reap what is left of it.
            self.shutdown().await;
            return Err(McpError::invalid_state("connecting or ready", previous));
        }

        debug!(server = %self.name(), "Closing tool server connection");

        self.shutdown().await;

        info!(server = %self.name(), "Tool server connection closed");

        Ok(())
    }

    /// Tear down the session, whatever state it is in.
    async fn shutdown(&self) {
        self.shared.mark_closed();

        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            // Closing stdin lets well-behaved servers exit on their own.
            drop(session.stdin);

            if let Err(e) = session.process.terminate(TERMINATE_GRACE).await {
                warn!(server = %self.name(), error = %e, "Failed to terminate tool server");
            }

            session.reader.abort();
            session.stderr_logger.abort();
        }

        self.shared.fail_pending();
    }
}

#[async_trait]
impl ToolClient for McpConnection {
    async fn connect(&self) -> Result<(), McpError> {
        McpConnection::connect(self).await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        McpConnection::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        McpConnection::call_tool(self, name, arguments).await
    }

    async fn close(&self) -> Result<(), McpError> {
        McpConnection::close(self).await
    }
}

/// Drain stdout, routing responses, until the server closes it.
async fn read_responses(shared: Arc<Shared>, stdout: ChildStdout) {
    if let Err(e) = for_each_line(stdout, |line| shared.dispatch(line)).await {
        warn!(server = %shared.name, error = %e, "Failed to read from tool server");
    }

    match shared.mark_closed() {
        ConnectionState::Connecting | ConnectionState::Ready => {
            warn!(server = %shared.name, "Tool server exited unexpectedly");
        }
        _ => debug!(server = %shared.name, "Tool server output closed"),
    }

    shared.fail_pending();
}

/// Forward server stderr to the log; it is diagnostic only.
async fn log_stderr(name: String, stderr: ChildStderr) {
    let forwarded = for_each_line(stderr, |line| {
        debug!(server = %name, "server stderr: {}", line.trim_end());
    })
    .await;

    if let Err(e) = forwarded {
        debug!(server = %name, error = %e, "Stopped reading server stderr");
    }
}

/// Feed each newline-terminated chunk of `reader` to `on_line` until end of
/// stream. Invalid UTF-8 is replaced rather than ending the stream.
async fn for_each_line<R, F>(reader: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        on_line(&String::from_utf8_lossy(&buf));
    }
}
