//! Configuration system for Curio.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Main configuration struct for Curio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tool server settings
    pub tools: ToolsConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Upper bound for a single per-call invocation, in seconds
    pub call_timeout_secs: u64,
    /// Per-request timeout inside a long-lived session, in seconds (0 disables)
    pub session_timeout_secs: u64,
    /// Optional path to a servers document (JSON or TOML)
    pub servers_file: Option<PathBuf>,
    /// Inline server definitions, keyed by server name
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            session_timeout_secs: 30,
            servers_file: None,
            servers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset
    pub level: String,
    /// Output format: full, compact
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

/// Launch description of one tool server.
///
/// Immutable once loaded; any number of clients may be built from the same
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable path or name resolved through `PATH`.
    pub command: String,
    /// Ordered argument list.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child process.
    #[serde(
        default,
        rename = "cwd",
        alias = "working_dir",
        skip_serializing_if = "Option::is_none"
    )]
    pub working_dir: Option<PathBuf>,
    /// Environment overrides, merged over the host environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    /// Replace the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append a single argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Declarative servers document: `{ "servers": { "<name>": ServerConfig } }`.
///
/// `servers` may be absent, `null` or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServersDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<BTreeMap<String, ServerConfig>>,
}

impl ServersDocument {
    /// Parse a JSON servers document.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a TOML servers document.
    pub fn from_toml_str(source: &str) -> Result<Self, Error> {
        Ok(toml::from_str(source)?)
    }

    /// Read a servers document from disk. Files ending in `.toml` are parsed
    /// as TOML, everything else as JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            Self::from_toml_str(&source)
        } else {
            Self::from_json_str(&source)
        }
    }

    /// Iterate over `(name, config)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.servers.iter().flat_map(|servers| servers.iter())
    }

    /// Insert or replace a server entry.
    pub fn insert(&mut self, name: impl Into<String>, config: ServerConfig) {
        self.servers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), config);
    }

    /// Number of server entries.
    pub fn len(&self) -> usize {
        self.servers.as_ref().map(BTreeMap::len).unwrap_or(0)
    }

    /// Whether the document defines no servers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "tools.call_timeout_secs")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: [&str; 2] = ["full", "compact"];

impl Config {
    /// Load configuration from all sources.
    ///
    /// Environment variables use `__` as the nesting separator, e.g.
    /// `CURIO_TOOLS__CALL_TIMEOUT_SECS=10`.
    pub fn load() -> Result<Self, figment::Error> {
        let config_dir = Self::config_dir();

        Self::base_figment()
            // User config
            .merge(Toml::file(config_dir.join("config.toml")))
            // Project config
            .merge(Toml::file(".curio/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".curio/config.local.toml"))
            // Environment variables
            .merge(Env::prefixed("CURIO_").split("__"))
            .extract()
    }

    /// Load configuration from defaults plus a single TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::base_figment()
            .merge(Toml::file(path.as_ref()))
            .extract()
    }

    fn base_figment() -> Figment {
        Figment::new().merge(Serialized::defaults(Config::default()))
    }

    /// Fail on validation errors; log warnings.
    pub fn ensure_valid(&self) -> Result<(), Error> {
        let result = self.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Validation(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.tools.call_timeout_secs == 0 {
            result.add_error("tools.call_timeout_secs", "call_timeout_secs must be greater than 0");
        }

        if self.tools.session_timeout_secs == 0 {
            result.add_warning(
                "tools.session_timeout_secs",
                "session requests have no timeout and may hang on an unresponsive server",
            );
        }

        if let Some(ref path) = self.tools.servers_file {
            if !path.exists() {
                result.add_warning(
                    "tools.servers_file",
                    format!("{} does not exist", path.display()),
                );
            }
        }

        for (name, server) in &self.tools.servers {
            if name.trim().is_empty() {
                result.add_error("tools.servers", "server name cannot be empty");
            }
            if server.command.trim().is_empty() {
                result.add_error(
                    format!("tools.servers.{}.command", name),
                    "command cannot be empty",
                );
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            result.add_error(
                "logging.level",
                format!("Invalid log level '{}'. Valid values: {:?}", self.logging.level, VALID_LOG_LEVELS),
            );
        }

        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            result.add_error(
                "logging.format",
                format!("Invalid log format '{}'. Valid values: {:?}", self.logging.format, VALID_LOG_FORMATS),
            );
        }

        result
    }

    /// Build the effective servers document: the `servers_file` document
    /// (if any) overlaid with inline `[tools.servers]` entries.
    pub fn servers_document(&self) -> Result<ServersDocument, Error> {
        let mut document = match self.tools.servers_file {
            Some(ref path) => ServersDocument::from_path(path)?,
            None => ServersDocument::default(),
        };

        for (name, server) in &self.tools.servers {
            document.insert(name.clone(), server.clone());
        }

        Ok(document)
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("curio"))
            .unwrap_or_else(|| PathBuf::from("~/.config/curio"))
    }
}
