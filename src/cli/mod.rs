//! Command-line interface parsing and handling
//!
//! `serve` runs the gateway until Ctrl-C; the other subcommands inspect or
//! maintain local state and exit.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::core::audit::TracingAuditSink;
use crate::core::clock::RuntimeClock;
use crate::core::config::data::{normalize_server_name, path_display};
use crate::core::config::{ConfigError, ConfigSource, FileConfigSource, GatewayConfig};
use crate::gateway::{Gateway, GatewayParts};
use crate::mcp::factory::McpConnectionFactory;
use crate::mcp::oauth::client::HttpOAuthAuthorizer;
use crate::mcp::oauth::tokens::token_store_for;
use crate::mcp::targets::TargetPhase;
use crate::permissions::CompiledPolicy;

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(about = "MCP gateway with per-consumer tool policy")]
#[command(
    long_about = "Gatehouse connects to the MCP servers listed in its configuration, merges \
their tools into one namespaced catalog and gates every call by consumer policy.\n\n\
Environment Variables:\n\
  RUST_LOG          Log filter; overrides --log-level"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(short = 'l', long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Connect every target server and serve until interrupted (default)
    Serve,
    /// Load the configuration, compile the permission policy and print a summary
    CheckConfig,
    /// Manage persisted OAuth tokens
    Tokens {
        #[command(subcommand)]
        command: TokensCommands,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum TokensCommands {
    /// Forget the tokens stored for a target server
    Clear {
        /// Target server name
        server: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

/// `RUST_LOG` wins over `--log-level`, which wins over the default.
pub fn log_filter(rust_log: Option<&str>, log_level: Option<&str>) -> String {
    rust_log
        .filter(|value| !value.trim().is_empty())
        .or(log_level)
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

fn init_tracing(log_level: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directives = log_filter(rust_log.as_deref(), log_level);
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("⚠️  Ignoring invalid log filter {directives:?}: {err}");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(args: &Args) -> Result<PathBuf, ConfigError> {
    match &args.config {
        Some(path) => Ok(path.clone()),
        None => GatewayConfig::default_config_path(),
    }
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let path = config_path(&args)?;
    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(path).await,
        Commands::CheckConfig => match check_config(&path) {
            Ok(summary) => {
                print!("{summary}");
                Ok(())
            }
            Err(err) => {
                eprintln!("❌ Invalid configuration {}: {err}", path_display(&path));
                std::process::exit(1);
            }
        },
        Commands::Tokens {
            command: TokensCommands::Clear { server },
        } => {
            let config = GatewayConfig::load_from_path(&path)?;
            if clear_tokens(&config, &server)? {
                println!("✅ Cleared tokens for {server}");
            } else {
                println!("No tokens stored for {server}");
            }
            Ok(())
        }
    }
}

async fn serve(path: PathBuf) -> Result<(), Box<dyn Error>> {
    let source = Arc::new(FileConfigSource::open(path)?);
    let config = source.snapshot();
    config.validate()?;

    let environment: HashMap<String, String> = std::env::vars().collect();
    let factory = Arc::new(McpConnectionFactory::new(&config.connection, environment)?);
    let authorizer = Arc::new(HttpOAuthAuthorizer::new(factory.http_client(), &config.oauth));
    let gateway = Gateway::new(GatewayParts {
        config: source.clone(),
        factory,
        authorizer,
        tokens: token_store_for(&config.oauth)?,
        clock: RuntimeClock::shared(),
        audit: Arc::new(TracingAuditSink),
    });

    for (server, outcome) in gateway.start().await? {
        match outcome {
            Ok(TargetPhase::PendingAuth) => {
                let url = gateway.get_authorization_url(&server).ok().flatten();
                info!(server = %server, url = url.as_deref().unwrap_or("-"), "Target server awaits authorization");
            }
            Ok(phase) => info!(server = %server, phase = %phase, "Target server settled"),
            Err(err) => warn!(server = %server, error = %err, "Target server did not start"),
        }
    }

    info!(config = %path_display(source.path()), "Gateway running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    gateway.shutdown().await;
    Ok(())
}

/// Loads, validates and compiles the configuration at `path`, returning a
/// printable summary.
pub fn check_config(path: &Path) -> Result<String, ConfigError> {
    let config = GatewayConfig::load_from_path(path)?;
    config.validate()?;
    let policy = CompiledPolicy::compile(1, &config)?;

    let mut summary = String::new();
    let _ = writeln!(summary, "Configuration: {}", path_display(path));
    let _ = writeln!(summary, "Consumers ({}):", policy.consumers.len());
    for tag in config.permissions.consumers.keys() {
        let _ = writeln!(summary, "  {tag}");
    }
    let _ = writeln!(summary, "Tool groups ({}):", config.tool_groups.len());
    for group in &config.tool_groups {
        let services: Vec<&str> = group.services.keys().map(String::as_str).collect();
        let _ = writeln!(summary, "  {} -> {}", group.name, services.join(", "));
    }
    let _ = writeln!(summary, "Target servers ({}):", config.target_servers.len());
    for server in &config.target_servers {
        let _ = writeln!(
            summary,
            "  {} ({})",
            normalize_server_name(&server.name),
            server.transport_label()
        );
    }
    Ok(summary)
}

pub fn clear_tokens(config: &GatewayConfig, server: &str) -> Result<bool, Box<dyn Error>> {
    let store = token_store_for(&config.oauth)?;
    Ok(store.remove(&normalize_server_name(server))?)
}

#[cfg(test)]
mod tests;
