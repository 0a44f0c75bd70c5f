//! Session management core.
//!
//! Tracks per-client session state across independent activities:
//! - An in-memory cache with per-session holder counts, so concurrent
//!   activities share one live instance of a session
//! - Pluggable persistence, either in-process only or a shared key-value
//!   service reached through a bounded connection pool
//! - Idle-timeout expiry driven by a background scavenger
//! - Per-activity agents that flush changes when the activity completes
//!
//! # Example
//!
//! ```rust,ignore
//! use sessa_session::{SessionManager, SessionManagerConfig};
//!
//! let manager = SessionManager::new(SessionManagerConfig::new().with_group_name("web"))?;
//! manager.start().await?;
//!
//! let mut agent = manager.new_session_agent();
//! agent.set_attribute("user", "alice").await?;
//! agent.complete().await?;
//! ```

mod agent;
mod cache;
mod config;
mod data;
mod error;
mod handler;
mod ids;
mod manager;
mod scavenger;
mod stats;
pub mod store;

pub use agent::{AttributeNames, SessionAgent, SessionInfo};
pub use cache::{CacheEntry, Lookup, Release, SessionCache, Sweep};
pub use config::{
    DEFAULT_FLUSH_ATTEMPTS, DEFAULT_KEY_PREFIX, DEFAULT_MAX_IDLE_SECS,
    DEFAULT_SCAVENGE_INTERVAL_SECS, DistributedStoreConfig, SessionManagerConfig, StoreConfig,
};
pub use data::{SessionData, now_millis};
pub use error::{Error, Result};
pub use handler::{ScavengeReport, SessionHandler};
pub use manager::SessionManager;
pub use scavenger::{Scavenger, ScavengerState};
pub use stats::SessionStats;
pub use store::{LocalStore, SessionStore};
