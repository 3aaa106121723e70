//! # curio-mcp
//!
//! Tool server client integration for Curio.
//!
//! This crate provides:
//! - Process launching for stdio tool servers
//! - Newline-delimited JSON-RPC framing tolerant of log noise
//! - A per-call client that runs one process per request
//! - A long-lived connection client with a capability handshake
//! - A registry resolving server names to ready-to-use clients

pub mod client;
pub mod connection;
pub mod error;
pub mod framing;
pub mod launcher;
pub mod protocol;
pub mod registry;

pub use client::{RpcClient, ToolClient, DEFAULT_CALL_TIMEOUT};
pub use connection::{ConnectionState, McpConnection};
pub use curio_core::{ServerConfig, ServersDocument};
pub use error::McpError;
pub use protocol::{ToolDefinition, ToolOutput};
pub use registry::ServerRegistry;
