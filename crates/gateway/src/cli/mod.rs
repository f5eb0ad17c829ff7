pub mod chat;
pub mod config;
pub mod run;

use clap::{Parser, Subcommand};

/// An agentic AI gateway.
#[derive(Debug, Parser)]
#[command(name = "agentrt", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Start an interactive chat REPL against the local gateway.
    Chat,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Send a single message to the agent and print the response.
    Run {
        /// The message to send.
        message: String,
        /// Session key (defaults to "cli:run").
        #[arg(long, default_value = "cli:run")]
        session: String,
        /// Model override (e.g. "openai/gpt-4o").
        #[arg(long)]
        model: Option<String>,
        /// Output the full response as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `SA_CONFIG` (or
/// `config.toml` by default). Returns the parsed [`Config`] and the path
/// that was used.
///
/// Shared by `serve`, `run`, `chat`, and `config` subcommands so the
/// logic lives in one place.
pub fn load_config() -> anyhow::Result<(agentrt_domain::config::Config, String)> {
    let config_path = std::env::var("SA_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        agentrt_domain::config::Config::default()
    };

    Ok((config, config_path))
}
