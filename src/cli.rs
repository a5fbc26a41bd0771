use std::path::PathBuf;

use clap::Parser;
use clap_complete::Shell;

use crate::config::Config;
use crate::providers::Provider;

#[derive(Parser)]
#[command(name = "planroom")]
#[command(version = "0.3.0")]
#[command(about = "Multi-user collaborative project planning over a polling-synchronized chat API")]
pub struct Args {
    /// Project to join in console mode
    pub project: Option<String>,

    /// Display name shown to other participants
    #[arg(long, short)]
    pub name: Option<String>,

    /// Run the API server instead of the console client
    #[arg(long)]
    pub serve: bool,

    /// Port for the API server
    #[arg(long)]
    pub port: Option<u16>,

    /// SQLite database path for the server
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// LLM provider: openai, anthropic, or mock
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// Model name (e.g. gpt-4o, claude-sonnet-4-20250514)
    #[arg(long)]
    pub model: Option<String>,

    /// Base URL of the API server, for console mode
    #[arg(long)]
    pub server_url: Option<String>,

    /// Polling interval in milliseconds, for console mode
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Print shell completions for the given shell and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}

/// Fold command-line flags into the layered config; flags win over the file
/// and the environment.
pub fn apply_to_config(args: &Args, config: &mut Config) {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    if let Some(provider) = &args.provider {
        config.provider = provider.clone();
    }
    if args.model.is_some() {
        config.model = args.model.clone();
    }
    if let Some(url) = &args.server_url {
        config.server_url = url.clone();
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
}
