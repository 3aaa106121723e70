//! # curio-cli
//!
//! Command-line interface for Curio tool servers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use curio_core::{error::format_error_with_suggestion, Config};
use curio_mcp::ServerRegistry;

mod commands;

/// Application context containing shared state.
pub struct AppContext {
    pub config: Config,
    pub registry: ServerRegistry,
}

/// Curio - call stdio tool servers from the command line
#[derive(Parser)]
#[command(name = "curio")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Servers document to load (JSON or TOML), overriding tools.servers_file
    #[arg(long, value_name = "PATH", global = true)]
    servers_file: Option<PathBuf>,

    /// Per-call timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// Keep one server process alive for the whole command
    #[arg(long, global = true)]
    session: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered tool servers
    Servers,
    /// List the tools a server exposes
    Tools {
        /// Server name
        server: String,
    },
    /// Call a tool and print its result
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref path) = self.servers_file {
            config.tools.servers_file = Some(path.clone());
        }
        if let Some(secs) = self.timeout {
            config.tools.call_timeout_secs = secs;
            config.tools.session_timeout_secs = secs;
        }
    }
}

fn init_logging(verbose: bool, config: &Config) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    // Logs go to stderr so command output stays parseable.
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "compact" {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let (mut config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    cli.apply_overrides(&mut config);

    init_logging(cli.verbose, &config);

    if let Some(e) = load_error {
        tracing::warn!("Failed to load config, using defaults: {}", e);
    }

    if let Commands::Version = cli.command {
        println!("curio {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    config.ensure_valid().map_err(|e| anyhow::anyhow!(format_error_with_suggestion(&e)))?;

    // Initialize server registry
    let registry = ServerRegistry::from_config(&config)
        .map_err(|e| anyhow::anyhow!(format_error_with_suggestion(&e)))?;

    // Create application context
    let ctx = Arc::new(AppContext { config, registry });

    // Handle subcommands
    match cli.command {
        Commands::Servers => {
            commands::servers::list(&ctx);
        }
        Commands::Tools { server } => {
            commands::tools::list(&ctx, &server, cli.session).await?;
        }
        Commands::Call { server, tool, args } => {
            commands::tools::call(&ctx, &server, &tool, &args, cli.session).await?;
        }
        Commands::Config { action } => {
            commands::config::handle(action, &ctx)?;
        }
        Commands::Version => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "curio",
            "call",
            "youtube",
            "get_video",
            "--args",
            r#"{"url":"x"}"#,
            "--session",
        ])
        .unwrap();

        assert!(cli.session);
        match cli.command {
            Commands::Call { server, tool, args } => {
                assert_eq!(server, "youtube");
                assert_eq!(tool, "get_video");
                assert_eq!(args, r#"{"url":"x"}"#);
            }
            _ => panic!("expected call command"),
        }
    }

    #[test]
    fn test_call_args_default_to_empty_object() {
        let cli = Cli::try_parse_from(["curio", "call", "notes", "search"]).unwrap();
        match cli.command {
            Commands::Call { args, .. } => assert_eq!(args, "{}"),
            _ => panic!("expected call command"),
        }
    }

    #[test]
    fn test_tools_requires_server() {
        assert!(Cli::try_parse_from(["curio", "tools"]).is_err());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let cli = Cli::try_parse_from([
            "curio",
            "--servers-file",
            "/etc/curio/servers.json",
            "--timeout",
            "5",
            "servers",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.apply_overrides(&mut config);

        assert_eq!(
            config.tools.servers_file,
            Some(PathBuf::from("/etc/curio/servers.json"))
        );
        assert_eq!(config.tools.call_timeout_secs, 5);
        assert_eq!(config.tools.session_timeout_secs, 5);
    }

    #[test]
    fn test_no_overrides_keep_config() {
        let cli = Cli::try_parse_from(["curio", "config", "show"]).unwrap();
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.tools.call_timeout_secs, 30);
        assert!(config.tools.servers_file.is_none());
    }
}
