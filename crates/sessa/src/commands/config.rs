//! Config command - session configuration management.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};
use sessa_session::SessionManagerConfig;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved session configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Write a config file with defaults
    Init {
        /// Write here instead of the default location
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Path => cmd_path(ctx),
        ConfigCommand::Init { path, force } => cmd_init(path, force),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&ctx.config)?);
        return Ok(());
    }

    match &ctx.config_path {
        Some(path) => println!("# Loaded from {}\n", path.display()),
        None => println!("# No config file loaded (using defaults)\n"),
    }
    print!("{}", ctx.config.to_toml()?);
    Ok(())
}

fn cmd_path(ctx: &Context) -> Result<()> {
    let path = ctx
        .config_path
        .clone()
        .or_else(super::default_config_path)
        .ok_or_else(|| anyhow!("Could not determine config directory"))?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => super::default_config_path()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?,
    };

    if path.exists() && !force {
        println!("Config file already exists: {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    SessionManagerConfig::default().save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
