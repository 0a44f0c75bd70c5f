//! Sessa - operator tool for the session management core.
//!
//! Main entry point for the Sessa CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{config, ping, soak};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Sessa - drive, ping and inspect a session manager
#[derive(Parser)]
#[command(name = "sessa")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Session config file (default: $XDG_CONFIG_HOME/sessa/session.toml)
    #[arg(short, long, global = true, env = "SESSA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write JSON logs to a daily rotating file in this directory
    #[arg(long, global = true, env = "SESSA_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run concurrent activities against a session manager and report counters
    Soak(soak::SoakArgs),

    /// Check connectivity to the configured session store
    Ping(ping::PingArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::prelude::*;

    let cli = Cli::parse();

    // Console (human-readable, stderr) + optional rotating JSON file
    let filter = if cli.verbose {
        "sessa=debug,sessa_session=debug,info"
    } else {
        "sessa=info,sessa_session=info,warn"
    };

    let (file_layer, _guard) = match &cli.log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "sessa.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "sessa=trace,sessa_session=trace,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(file_layer)
        .init();

    let (session_config, config_path) = commands::load_config(cli.config.as_deref())?;

    let ctx = commands::Context {
        config: session_config,
        config_path,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Soak(args) => soak::run(args, &ctx).await,
        Commands::Ping(args) => ping::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
