//! CLI command handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use sessa_session::SessionManagerConfig;

pub mod config;
pub mod ping;
pub mod soak;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Resolved session configuration.
    pub config: SessionManagerConfig,
    /// File the configuration was read from, if any.
    pub config_path: Option<PathBuf>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// Default config location: `$XDG_CONFIG_HOME/sessa/session.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sessa").join("session.toml"))
}

/// Load the session config from an explicit path, else the default path if
/// it exists, else built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<(SessionManagerConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok((SessionManagerConfig::default(), None)),
        },
    };

    let config = SessionManagerConfig::load(&path)
        .with_context(|| format!("Failed to load session config from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded session config");
    Ok((config, Some(path)))
}
