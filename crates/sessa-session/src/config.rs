//! Configuration for the session manager and its backing store.
//!
//! ```toml
//! [session]
//! group_name = "shop"
//! default_max_idle_secs = 1800
//! scavenge_interval_secs = 60
//!
//! [session.store]
//! kind = "distributed"
//! endpoints = ["127.0.0.1:6379"]
//! pool_max_total = 16
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default idle timeout for new sessions (30 minutes).
pub const DEFAULT_MAX_IDLE_SECS: i64 = 1800;

/// Default interval between scavenge passes.
pub const DEFAULT_SCAVENGE_INTERVAL_SECS: u64 = 60;

/// Default number of attempts made by a single flush before giving up
/// until the next flush opportunity.
pub const DEFAULT_FLUSH_ATTEMPTS: u32 = 2;

/// Default prefix for keys written to a distributed backend.
pub const DEFAULT_KEY_PREFIX: &str = "session:";

/// Configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Namespace prefixed to generated session ids so several managers can
    /// share one store without collisions. Empty means no prefix.
    #[serde(alias = "groupName")]
    pub group_name: String,

    /// Idle timeout applied to sessions that don't set their own.
    /// Values `<= 0` disable expiry.
    #[serde(alias = "defaultMaxIdleSecs")]
    pub default_max_idle_secs: i64,

    /// Seconds between scavenge passes.
    #[serde(alias = "scavengeIntervalSecs")]
    pub scavenge_interval_secs: u64,

    /// Seconds after which a clean session is re-saved on completion so the
    /// backend TTL stays fresh. `0` means half of the session's idle window.
    #[serde(alias = "savePeriodSecs")]
    pub save_period_secs: u64,

    /// Attempts made by a single flush before the session is left dirty
    /// for the next flush opportunity.
    #[serde(alias = "flushAttempts")]
    pub flush_attempts: u32,

    /// Backing store selection.
    pub store: StoreConfig,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            group_name: String::new(),
            default_max_idle_secs: DEFAULT_MAX_IDLE_SECS,
            scavenge_interval_secs: DEFAULT_SCAVENGE_INTERVAL_SECS,
            save_period_secs: 0,
            flush_attempts: DEFAULT_FLUSH_ATTEMPTS,
            store: StoreConfig::Local,
        }
    }
}

impl SessionManagerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    ///
    /// Settings are read from a `[session]` table when present, otherwise
    /// from the top level of the document.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let doc: toml::Value = toml::from_str(toml_str)?;
        let config: Self = match doc.get("session") {
            Some(section) => section.clone().try_into()?,
            None => doc.try_into()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string under a `[session]` table.
    pub fn to_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Doc<'a> {
            session: &'a SessionManagerConfig,
        }
        Ok(toml::to_string_pretty(&Doc { session: self })?)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Write to a TOML file, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<()> {
        if self.scavenge_interval_secs == 0 {
            return Err(Error::Config(
                "scavenge_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.flush_attempts == 0 {
            return Err(Error::Config(
                "flush_attempts must be at least 1".to_string(),
            ));
        }
        if let StoreConfig::Distributed(store) = &self.store {
            store.validate()?;
        }
        Ok(())
    }

    /// Set the group name used to prefix generated ids.
    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = group_name.into();
        self
    }

    /// Set the default idle timeout in seconds.
    pub fn with_default_max_idle_secs(mut self, secs: i64) -> Self {
        self.default_max_idle_secs = secs;
        self
    }

    /// Set the scavenge interval in seconds.
    pub fn with_scavenge_interval_secs(mut self, secs: u64) -> Self {
        self.scavenge_interval_secs = secs;
        self
    }

    /// Set the save period in seconds.
    pub fn with_save_period_secs(mut self, secs: u64) -> Self {
        self.save_period_secs = secs;
        self
    }

    /// Set the number of attempts per flush.
    pub fn with_flush_attempts(mut self, attempts: u32) -> Self {
        self.flush_attempts = attempts;
        self
    }

    /// Set the backing store.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Scavenge interval as a [`Duration`].
    pub fn scavenge_interval(&self) -> Duration {
        Duration::from_secs(self.scavenge_interval_secs)
    }
}

/// Backing store selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Sessions live only in the process-local cache.
    #[default]
    Local,
    /// Sessions are persisted to an external key-value service.
    Distributed(DistributedStoreConfig),
}

/// Settings for the distributed store and its connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedStoreConfig {
    /// `host:port` addresses of the key-value service, tried in turn.
    #[serde(alias = "distributedEndpoints")]
    pub endpoints: Vec<String>,

    /// Connections opened eagerly when the manager starts.
    #[serde(alias = "poolMinIdle")]
    pub pool_min_idle: usize,

    /// Upper bound on connections open at once.
    #[serde(alias = "poolMaxTotal")]
    pub pool_max_total: usize,

    /// How long a caller waits for a free connection before failing.
    #[serde(alias = "poolBorrowTimeoutMs")]
    pub pool_borrow_timeout_ms: u64,

    /// Bound on a single command round-trip.
    #[serde(alias = "ioTimeoutMs")]
    pub io_timeout_ms: u64,

    /// Prefix prepended to session ids to form backend keys.
    #[serde(alias = "keyPrefix")]
    pub key_prefix: String,
}

impl Default for DistributedStoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            pool_min_idle: 1,
            pool_max_total: 8,
            pool_borrow_timeout_ms: 2000,
            io_timeout_ms: 2000,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl DistributedStoreConfig {
    /// Create a distributed store config for the given endpoints.
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the pool bounds.
    pub fn with_pool(mut self, min_idle: usize, max_total: usize) -> Self {
        self.pool_min_idle = min_idle;
        self.pool_max_total = max_total;
        self
    }

    /// Set the pool borrow timeout.
    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.pool_borrow_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-command timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Pool borrow timeout as a [`Duration`].
    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_borrow_timeout_ms)
    }

    /// Command timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Check the store settings for inconsistent values.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(
                "distributed store requires at least one endpoint".to_string(),
            ));
        }
        if self.pool_max_total == 0 {
            return Err(Error::Config(
                "pool_max_total must be greater than zero".to_string(),
            ));
        }
        if self.pool_min_idle > self.pool_max_total {
            return Err(Error::Config(format!(
                "pool_min_idle ({}) exceeds pool_max_total ({})",
                self.pool_min_idle, self.pool_max_total
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionManagerConfig::default();
        assert_eq!(config.default_max_idle_secs, DEFAULT_MAX_IDLE_SECS);
        assert_eq!(config.scavenge_interval(), Duration::from_secs(60));
        assert_eq!(config.store, StoreConfig::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_session_table() {
        let toml = r#"
[session]
group_name = "shop"
default_max_idle_secs = 600
scavenge_interval_secs = 5

[session.store]
kind = "distributed"
endpoints = ["10.0.0.1:6379", "10.0.0.2:6379"]
pool_max_total = 4
"#;
        let config = SessionManagerConfig::from_toml(toml).unwrap();
        assert_eq!(config.group_name, "shop");
        assert_eq!(config.default_max_idle_secs, 600);
        assert_eq!(config.scavenge_interval_secs, 5);

        let StoreConfig::Distributed(store) = config.store else {
            panic!("expected distributed store");
        };
        assert_eq!(store.endpoints.len(), 2);
        assert_eq!(store.pool_max_total, 4);
        assert_eq!(store.pool_min_idle, 1);
        assert_eq!(store.key_prefix, DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn test_parse_bare_camel_case() {
        let toml = r#"
groupName = "api"
defaultMaxIdleSecs = 90

[store]
kind = "distributed"
distributedEndpoints = ["kv:6379"]
poolMinIdle = 2
poolMaxTotal = 3
poolBorrowTimeoutMs = 150
"#;
        let config = SessionManagerConfig::from_toml(toml).unwrap();
        assert_eq!(config.group_name, "api");
        assert_eq!(config.default_max_idle_secs, 90);
        let StoreConfig::Distributed(store) = config.store else {
            panic!("expected distributed store");
        };
        assert_eq!(store.endpoints, vec!["kv:6379".to_string()]);
        assert_eq!(store.borrow_timeout(), Duration::from_millis(150));
    }

    #[test]
    fn test_validate_rejects_bad_pool() {
        let toml = r#"
[session.store]
kind = "distributed"
endpoints = ["kv:6379"]
pool_min_idle = 5
pool_max_total = 2
"#;
        let err = SessionManagerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_missing_endpoints() {
        let config = SessionManagerConfig::new()
            .with_store(StoreConfig::Distributed(DistributedStoreConfig::default()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = SessionManagerConfig::new().with_scavenge_interval_secs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = SessionManagerConfig::new()
            .with_group_name("shop")
            .with_store(StoreConfig::Distributed(
                DistributedStoreConfig::new(["127.0.0.1:6379"]).with_pool(0, 2),
            ));
        let text = config.to_toml().unwrap();
        assert!(text.contains("[session]"));
        let parsed = SessionManagerConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.toml");

        let config = SessionManagerConfig::new()
            .with_group_name("files")
            .with_store(StoreConfig::Distributed(DistributedStoreConfig::new([
                "10.0.0.1:6379",
            ])));
        config.save(&path).unwrap();

        assert_eq!(SessionManagerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SessionManagerConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
