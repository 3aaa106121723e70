//! Tool server error types.

use std::time::Duration;

use thiserror::Error;

/// Errors on the byte streams of an already launched process.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A stdio pipe was not captured at spawn time.
    #[error("child {0} unavailable after spawn")]
    MissingPipe(&'static str),

    /// Failed to write to the child's stdin.
    #[error("write error: {0}")]
    WriteError(std::io::Error),

    /// Failed to read from the child's stdout or stderr.
    #[error("read error: {0}")]
    ReadError(std::io::Error),

    /// Failed to wait on or terminate the process.
    #[error("failed to terminate process: {0}")]
    TerminateFailed(std::io::Error),
}

/// Errors that can occur while talking to a tool server.
#[derive(Debug, Error)]
pub enum McpError {
    /// The executable could not be started.
    #[error("failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// No response arrived before the deadline.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Output contained no decodable response.
    #[error("protocol error: {message}")]
    ProtocolParse { message: String, diagnostics: String },

    /// The server answered with an `error` object.
    #[error("{message}")]
    Remote {
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The process exited unsuccessfully without a parsable result.
    #[error("server process {}", describe_exit(.code))]
    ProcessExit { code: Option<i32>, stderr: String },

    /// Registry lookup for an unknown name.
    #[error("server not registered: {0}")]
    NotRegistered(String),

    /// Operation not permitted in the current connection state.
    #[error("invalid connection state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The session's server went away while calls were outstanding.
    #[error("connection to server lost")]
    ConnectionLost,

    /// Capability handshake failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Stream-level error after launch.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

impl McpError {
    /// Create a protocol parse error.
    pub fn protocol(message: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self::ProtocolParse {
            message: message.into(),
            diagnostics: diagnostics.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl ToString) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Create an initialization failed error.
    pub fn init_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Whether a caller may reasonably retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ConnectionLost)
    }

    /// Captured diagnostic output attached to this error, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::ProtocolParse { diagnostics, .. } => Some(diagnostics.as_str()),
            Self::ProcessExit { stderr, .. } => Some(stderr.as_str()),
            _ => None,
        }
        .filter(|text| !text.is_empty())
    }
}

impl From<McpError> for curio_core::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::NotRegistered(name) => {
                curio_core::Error::NotFound(format!("server '{}'", name))
            }
            other => curio_core::Error::Mcp(other.to_string()),
        }
    }
}
