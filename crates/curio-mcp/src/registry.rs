//! Tool server registry.
//!
//! [`ServerRegistry`] maps symbolic server names to launch configurations
//! and hands out clients bound to them. It is an ordinary value: build one
//! at startup, populate it, then share it (typically behind an `Arc`) with
//! whatever needs clients.

use std::collections::BTreeMap;
use std::time::Duration;

use curio_core::{Config, ServerConfig, ServersDocument};
use tracing::{debug, info};

use crate::client::{RpcClient, DEFAULT_CALL_TIMEOUT};
use crate::connection::McpConnection;
use crate::error::McpError;

/// Name → configuration table for tool servers.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    /// Server configurations by name.
    servers: BTreeMap<String, ServerConfig>,
    /// Timeout given to per-call clients.
    call_timeout: Duration,
    /// Per-request timeout given to session clients.
    session_timeout: Option<Duration>,
}

impl ServerRegistry {
    /// Create an empty registry with default timeouts.
    pub fn new() -> Self {
        Self {
            servers: BTreeMap::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            session_timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }

    /// Build a registry from loaded configuration: timeouts from `[tools]`
    /// and servers from the effective servers document.
    pub fn from_config(config: &Config) -> Result<Self, curio_core::Error> {
        let session_timeout = match config.tools.session_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let mut registry = Self::new()
            .with_call_timeout(Duration::from_secs(config.tools.call_timeout_secs))
            .with_session_timeout(session_timeout);
        registry.load_from_config(&config.servers_document()?);

        Ok(registry)
    }

    /// Set the timeout for per-call clients.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the per-request timeout for session clients.
    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Insert or replace the configuration registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, config: ServerConfig) {
        let name = name.into();
        debug!(server = %name, command = %config.command, "Registering tool server");
        if self.servers.insert(name.clone(), config).is_some() {
            debug!(server = %name, "Replaced existing registration");
        }
    }

    /// Register every server in `document`. An absent or empty `servers`
    /// map registers nothing.
    pub fn load_from_config(&mut self, document: &ServersDocument) {
        for (name, config) in document.iter() {
            self.register(name.clone(), config.clone());
        }

        info!(count = document.len(), "Loaded tool server configuration");
    }

    /// Remove a registration. Returns whether one existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.servers.remove(name).is_some()
    }

    /// Create a fresh per-call client for `name`.
    pub fn get_client(&self, name: &str) -> Result<RpcClient, McpError> {
        let config = self.lookup(name)?;
        Ok(RpcClient::new(name, config.clone()).with_timeout(self.call_timeout))
    }

    /// Create a session client for `name` and complete its handshake.
    pub async fn connect(&self, name: &str) -> Result<McpConnection, McpError> {
        let config = self.lookup(name)?;
        let connection =
            McpConnection::new(name, config.clone()).with_request_timeout(self.session_timeout);
        connection.connect().await?;
        Ok(connection)
    }

    fn lookup(&self, name: &str) -> Result<&ServerConfig, McpError> {
        self.servers
            .get(name)
            .ok_or_else(|| McpError::NotRegistered(name.to_string()))
    }

    /// Get a server configuration by name.
    pub fn get_config(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// Check whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Registered server names, in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no servers are registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_new() {
        let registry = ServerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_get_client_unregistered() {
        let registry = ServerRegistry::new();
        match registry.get_client("unregistered-name") {
            Err(McpError::NotRegistered(name)) => assert_eq!(name, "unregistered-name"),
            other => panic!("expected not registered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_unregistered() {
        let registry = ServerRegistry::new();
        assert!(matches!(
            registry.connect("ghost").await,
            Err(McpError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ServerRegistry::new();
        registry.register("youtube", ServerConfig::new("yt-v1"));
        registry.register("youtube", ServerConfig::new("yt-v2").with_arg("--stdio"));

        assert_eq!(registry.len(), 1);
        let client = registry.get_client("youtube").unwrap();
        assert_eq!(client.config().command, "yt-v2");
        assert_eq!(client.config().args, vec!["--stdio".to_string()]);
    }

    #[test]
    fn test_clients_are_fresh() {
        let mut registry = ServerRegistry::new();
        registry.register("github", ServerConfig::new("gh-mcp"));

        let first = registry.get_client("github").unwrap();
        assert_eq!(first.next_request_id(), 1);
        assert_eq!(first.next_request_id(), 2);

        let second = registry.get_client("github").unwrap();
        assert_eq!(second.next_request_id(), 1);
    }

    #[test]
    fn test_load_from_empty_documents() {
        for json in ["{}", r#"{"servers": {}}"#] {
            let mut registry = ServerRegistry::new();
            registry.load_from_config(&ServersDocument::from_json_str(json).unwrap());
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn test_load_from_config() {
        let doc = ServersDocument::from_json_str(
            r#"{"servers": {
                "notes": {"command": "notes-mcp", "env": {"VAULT": "/data"}},
                "articles": {"command": "docker", "args": ["run", "-i", "articles"]}
            }}"#,
        )
        .unwrap();

        let mut registry = ServerRegistry::new();
        registry.register("notes", ServerConfig::new("old-notes"));
        registry.load_from_config(&doc);

        assert_eq!(registry.names(), vec!["articles".to_string(), "notes".to_string()]);
        assert_eq!(registry.get_config("notes").unwrap().command, "notes-mcp");
        assert!(registry.contains("articles"));
    }

    #[test]
    fn test_remove() {
        let mut registry = ServerRegistry::new();
        registry.register("test", ServerConfig::new("echo"));
        assert!(registry.remove("test"));
        assert!(!registry.remove("test"));
        assert!(registry.get_client("test").is_err());
    }

    #[test]
    fn test_timeouts_flow_into_clients() {
        let mut registry = ServerRegistry::new().with_call_timeout(Duration::from_secs(5));
        registry.register("s", ServerConfig::new("srv"));
        assert_eq!(registry.get_client("s").unwrap().timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.tools.call_timeout_secs = 12;
        config.tools.servers.insert("inline".to_string(), ServerConfig::new("inline-mcp"));

        let registry = ServerRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["inline".to_string()]);
        assert_eq!(
            registry.get_client("inline").unwrap().timeout(),
            Duration::from_secs(12)
        );
    }
}
