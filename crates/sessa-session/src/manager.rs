//! Top-level session manager.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::SessionAgent;
use crate::config::SessionManagerConfig;
use crate::error::Result;
use crate::handler::SessionHandler;
use crate::scavenger::{Scavenger, ScavengerState};
use crate::stats::SessionStats;
use crate::store::{self, SessionStore};

/// Owns the handler, its store and the scavenger, and hands out agents.
///
/// ```rust,ignore
/// let manager = SessionManager::new(SessionManagerConfig::new().with_group_name("web"))?;
/// manager.start().await?;
///
/// let mut agent = manager.new_session_agent_with_id(cookie_id);
/// agent.set_attribute("user", "alice").await?;
/// agent.complete().await?;
///
/// manager.stop().await;
/// ```
pub struct SessionManager {
    config: SessionManagerConfig,
    handler: Arc<SessionHandler>,
    scavenger: Mutex<Scavenger>,
}

impl SessionManager {
    /// Build a manager and the store its configuration names.
    pub fn new(config: SessionManagerConfig) -> Result<Self> {
        config.validate()?;
        let store = store::from_config(&config.store)?;
        Ok(Self::with_store(config, store))
    }

    /// Build a manager around an already constructed store.
    pub fn with_store(config: SessionManagerConfig, store: Arc<dyn SessionStore>) -> Self {
        let handler = Arc::new(SessionHandler::new(&config, store));
        let scavenger = Mutex::new(Scavenger::new(Arc::clone(&handler)));
        Self {
            config,
            handler,
            scavenger,
        }
    }

    /// Start the store and the scavenger. Calling it twice is harmless.
    ///
    /// A store that cannot be reached at startup is logged and tolerated;
    /// sessions stay cache-only until it comes back.
    pub async fn start(&self) -> Result<()> {
        let mut scavenger = self.scavenger.lock().await;
        if scavenger.state() == ScavengerState::Running {
            return Ok(());
        }

        let store = self.handler.store();
        if let Err(e) = store.start().await {
            if !e.is_recoverable() {
                return Err(e);
            }
            warn!(store = store.kind(), error = %e, "Session store not reachable at startup");
        }

        scavenger.start(self.config.scavenge_interval());
        info!(
            group = %self.config.group_name,
            store = store.kind(),
            max_idle_secs = self.handler.default_max_idle_secs(),
            "Session manager started"
        );
        Ok(())
    }

    /// Stop the scavenger and flush dirty sessions.
    pub async fn stop(&self) {
        self.scavenger.lock().await.stop().await;
        let flushed = self.handler.flush_all().await;
        info!(
            flushed,
            sessions = self.handler.cache().sessions_current(),
            "Session manager stopped"
        );
    }

    pub async fn is_running(&self) -> bool {
        self.scavenger.lock().await.state() == ScavengerState::Running
    }

    /// Generate a session id to hand to a client ahead of its first
    /// request. The first agent presenting it creates the session.
    pub fn new_session_id(&self) -> String {
        self.handler.new_session_id()
    }

    /// An agent for an activity without a session id yet.
    pub fn new_session_agent(&self) -> SessionAgent {
        SessionAgent::new(Arc::clone(&self.handler), None)
    }

    /// An agent for an activity that presented a session id.
    pub fn new_session_agent_with_id(&self, id: impl Into<String>) -> SessionAgent {
        SessionAgent::new(Arc::clone(&self.handler), Some(id.into()))
    }

    /// Invalidate a session without an agent, e.g. from an admin action.
    pub async fn invalidate_session(&self, id: &str) -> Result<bool> {
        self.handler.invalidate(id).await
    }

    /// Change the idle timeout given to sessions created from now on.
    pub fn set_default_max_idle_secs(&self, secs: i64) {
        self.handler.set_default_max_idle_secs(secs);
    }

    pub fn stats(&self) -> SessionStats {
        self.handler.stats()
    }

    pub fn handler(&self) -> &Arc<SessionHandler> {
        &self.handler
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistributedStoreConfig, StoreConfig};
    use crate::error::Error;

    #[tokio::test]
    async fn test_start_stop_local() {
        let manager = SessionManager::new(SessionManagerConfig::new()).unwrap();
        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert!(manager.is_running().await);

        manager.stop().await;
        assert!(!manager.is_running().await);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SessionManagerConfig::new()
            .with_store(StoreConfig::Distributed(DistributedStoreConfig::default()));
        assert!(matches!(SessionManager::new(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_flushes_dirty_sessions() {
        let manager = SessionManager::new(SessionManagerConfig::new()).unwrap();
        manager.start().await.unwrap();

        let mut agent = manager.new_session_agent();
        agent.set_attribute("a", 1).await.unwrap();
        let id = agent.session_id().unwrap().to_string();
        // Held, so still dirty when stop runs
        manager.stop().await;

        let entry = manager.handler().cache().peek(&id).unwrap();
        assert!(!entry.is_dirty());
        agent.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_default_idle_setter() {
        let manager = SessionManager::new(SessionManagerConfig::new()).unwrap();
        manager.set_default_max_idle_secs(42);

        let mut agent = manager.new_session_agent();
        let info = agent.get_session(true).await.unwrap().unwrap();
        assert_eq!(info.max_idle_secs, 42);
        agent.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_session_by_id() {
        let manager = SessionManager::new(SessionManagerConfig::new()).unwrap();
        let id = manager.new_session_id();
        let mut agent = manager.new_session_agent_with_id(&id);
        agent.get_session(true).await.unwrap();
        agent.complete().await.unwrap();

        assert!(manager.invalidate_session(&id).await.unwrap());
        assert!(!manager.invalidate_session(&id).await.unwrap());
        assert_eq!(manager.stats().sessions_invalidated, 1);

        let mut agent = manager.new_session_agent_with_id(&id);
        let info = agent.get_session(true).await.unwrap().unwrap();
        assert_ne!(info.id, id);
        agent.complete().await.unwrap();
    }
}
