//! Tool client interface and the per-call client.
//!
//! [`ToolClient`] is the contract callers depend on. [`RpcClient`] implements
//! it by launching a fresh server process for every call: write one request,
//! close stdin, collect output until exit, pick the response out of whatever
//! the process printed. No process outlives its call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use curio_core::ServerConfig;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::McpError;
use crate::framing;
use crate::launcher::{self, ProcessOutput};
use crate::protocol::{
    CallToolParams, JsonRpcRequest, ListToolsResult, RequestId, ToolDefinition, ToolOutput,
};

/// Default upper bound for one per-call invocation.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Substrings that mark stdout as carrying an answer even when the process
/// exits unsuccessfully.
const RESPONSE_MARKERS: [&str; 2] = ["\"result\"", "\"error\""];

/// Operations every tool client offers, whatever its process model.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Prepare the client for calls.
    async fn connect(&self) -> Result<(), McpError>;

    /// List the tools the server exposes.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError>;

    /// Invoke a tool by name.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, McpError>;

    /// Release any resources held by the client.
    async fn close(&self) -> Result<(), McpError>;
}

/// Per-call client bound to one server configuration.
///
/// Safe to share between tasks; concurrent calls each own an independent
/// process and only share the request id counter.
#[derive(Debug)]
pub struct RpcClient {
    /// Server name, for logging.
    name: String,
    /// Launch description.
    config: ServerConfig,
    /// Deadline for each call.
    timeout: Duration,
    /// Last issued request ID.
    request_counter: AtomicU64,
}

impl RpcClient {
    /// Create a client for `config` with the default timeout.
    pub fn new(name: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            timeout: DEFAULT_CALL_TIMEOUT,
            request_counter: AtomicU64::new(0),
        }
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocate the next request ID. The first ID issued is 1.
    pub fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Issue one request in a freshly launched process and return its result.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = RequestId::from(self.next_request_id());
        let line = framing::encode_message(&JsonRpcRequest::new(id.clone(), method, params))?;

        debug!(server = %self.name, id = %id, method = method, "Calling tool server");

        let mut process = launcher::launch(&self.config)?;

        let exchange = async {
            if let Err(e) = process.write_and_close(line.as_bytes()).await {
                // Servers that ignore stdin may exit before reading it.
                debug!(server = %self.name, id = %id, error = %e, "Request not delivered");
            }
            process.collect_output().await
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        let output = match outcome {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    server = %self.name,
                    id = %id,
                    method = method,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Tool server call timed out, killing process"
                );
                if let Err(e) = process.kill().await {
                    warn!(server = %self.name, error = %e, "Failed to kill timed out process");
                }
                return Err(McpError::Timeout(self.timeout));
            }
        };

        // The server is done; take down anything it left running.
        if let Err(e) = process.kill().await {
            debug!(server = %self.name, error = %e, "Failed to clear process group");
        }

        self.resolve(&id, output)
    }

    /// Turn a finished process's output into the call's outcome.
    fn resolve(&self, id: &RequestId, output: ProcessOutput) -> Result<Value, McpError> {
        let exit_code = output.status.code();

        if !output.status.success()
            && !RESPONSE_MARKERS.iter().any(|m| output.stdout.contains(m))
        {
            warn!(
                server = %self.name,
                id = %id,
                exit_code = ?exit_code,
                "Tool server exited without a response"
            );
            return Err(McpError::ProcessExit {
                code: exit_code,
                stderr: framing::excerpt(&output.stderr),
            });
        }

        match framing::find_response(&output.stdout, id) {
            Some(response) => {
                debug!(server = %self.name, id = %id, is_error = response.is_error(), "Received response");
                response.into_result()
            }
            None => Err(McpError::protocol(
                "no valid response found",
                diagnostics(&output),
            )),
        }
    }
}

#[async_trait]
impl ToolClient for RpcClient {
    /// Nothing to set up: every call launches its own process.
    async fn connect(&self) -> Result<(), McpError> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let result = self.call("tools/list", json!({})).await?;
        let tools = tools_from_result(result)?;

        debug!(server = %self.name, tool_count = tools.len(), "Listed tools");

        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;

        let output = ToolOutput::new(self.call("tools/call", params).await?);

        if output.is_error() {
            warn!(server = %self.name, tool = name, "Tool returned error");
        }

        Ok(output)
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

/// Extract the tool list from a `tools/list` result.
pub(crate) fn tools_from_result(result: Value) -> Result<Vec<ToolDefinition>, McpError> {
    if result.is_null() {
        return Ok(Vec::new());
    }

    let listing: ListToolsResult = serde_json::from_value(result).map_err(|e| {
        McpError::protocol(format!("malformed tools/list result: {}", e), String::new())
    })?;

    Ok(listing.tools)
}

fn diagnostics(output: &ProcessOutput) -> String {
    let mut parts = Vec::new();
    if !output.stderr.trim().is_empty() {
        parts.push(format!("stderr: {}", framing::excerpt(&output.stderr)));
    }
    if !output.stdout.trim().is_empty() {
        parts.push(format!("stdout: {}", framing::excerpt(&output.stdout)));
    }
    parts.join("\n")
}
