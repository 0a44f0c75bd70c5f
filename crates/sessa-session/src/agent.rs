//! Per-activity handle to a session.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::error;

use crate::cache::CacheEntry;
use crate::error::{Error, Result};
use crate::handler::SessionHandler;

/// Point-in-time view of the session an agent holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub creation_time: i64,
    pub last_accessed_time: i64,
    pub max_idle_secs: i64,
    pub is_new: bool,
}

impl SessionInfo {
    fn of(entry: &CacheEntry) -> Self {
        entry.with_data(|data| Self {
            id: data.id().to_string(),
            creation_time: data.creation_time(),
            last_accessed_time: data.last_accessed_time(),
            max_idle_secs: data.max_idle_secs(),
            is_new: entry.is_new(),
        })
    }
}

/// Attribute names captured when the iterator was created. Single pass.
#[derive(Debug)]
pub struct AttributeNames {
    names: std::vec::IntoIter<String>,
}

impl Iterator for AttributeNames {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.names.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.names.size_hint()
    }
}

impl ExactSizeIterator for AttributeNames {}

/// Handle one activity (a request, a job) uses to reach its session.
///
/// The session is bound lazily on the first call that needs it and stays
/// held until the agent is consumed by [`complete`](Self::complete) or
/// [`invalidate`](Self::invalidate). Dropping an agent that still holds a
/// session releases it without flushing and logs an error.
pub struct SessionAgent {
    handler: Arc<SessionHandler>,
    requested_id: Option<String>,
    entry: Option<Arc<CacheEntry>>,
}

impl SessionAgent {
    pub(crate) fn new(handler: Arc<SessionHandler>, requested_id: Option<String>) -> Self {
        Self {
            handler,
            requested_id,
            entry: None,
        }
    }

    /// Id the activity asked for, if any.
    pub fn requested_id(&self) -> Option<&str> {
        self.requested_id.as_deref()
    }

    /// Id of the bound session, if one is bound.
    pub fn session_id(&self) -> Option<&str> {
        self.entry.as_deref().map(CacheEntry::id)
    }

    /// Bind the session, creating one if `create` is set and none is found.
    ///
    /// Returns the already bound session on repeat calls. If the bound
    /// session was invalidated by another activity it is let go and the
    /// lookup starts over.
    pub async fn get_session(&mut self, create: bool) -> Result<Option<SessionInfo>> {
        if let Some(entry) = &self.entry {
            if !entry.is_invalid() {
                return Ok(Some(SessionInfo::of(entry)));
            }
            if let Some(stale) = self.entry.take() {
                self.requested_id = None;
                self.handler.complete(&stale).await?;
            }
        }

        let found = self
            .handler
            .get_session(self.requested_id.as_deref(), create)
            .await?;
        let info = found.as_deref().map(SessionInfo::of);
        self.entry = found;
        Ok(info)
    }

    /// The bound entry, binding one first if needed. An invalidated entry is
    /// returned as is so attribute access on it fails.
    async fn bound(&mut self, create: bool) -> Result<Option<&Arc<CacheEntry>>> {
        if self.entry.is_none() {
            self.entry = self
                .handler
                .get_session(self.requested_id.as_deref(), create)
                .await?;
        }
        Ok(self.entry.as_ref())
    }

    pub async fn get_attribute(&mut self, name: &str) -> Result<Option<Value>> {
        let handler = Arc::clone(&self.handler);
        match self.bound(false).await? {
            Some(entry) => handler.get_attribute(entry, name),
            None => Ok(None),
        }
    }

    /// Read an attribute and deserialize it into `T`.
    pub async fn get_attribute_as<T: DeserializeOwned>(&mut self, name: &str) -> Result<Option<T>> {
        self.get_attribute(name)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    /// Set an attribute, creating the session if needed. Setting `Null`
    /// removes the attribute. Returns the previous value.
    pub async fn set_attribute(
        &mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Value>> {
        let handler = Arc::clone(&self.handler);
        let entry = self.bound(true).await?.ok_or_else(|| {
            Error::InvalidState("session could not be created".to_string())
        })?;
        handler.set_attribute(entry, name, value.into())
    }

    pub async fn remove_attribute(&mut self, name: &str) -> Result<Option<Value>> {
        let handler = Arc::clone(&self.handler);
        match self.bound(false).await? {
            Some(entry) => handler.remove_attribute(entry, name),
            None => Ok(None),
        }
    }

    /// Names of the session's attributes, as of this call.
    pub async fn get_attribute_names(&mut self) -> Result<AttributeNames> {
        let handler = Arc::clone(&self.handler);
        let names = match self.bound(false).await? {
            Some(entry) => handler.attribute_names(entry)?,
            None => Vec::new(),
        };
        Ok(AttributeNames {
            names: names.into_iter(),
        })
    }

    /// Override the session's idle timeout. Fails with `NotFound` if the
    /// activity has no session.
    pub async fn set_max_idle_secs(&mut self, secs: i64) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let missing = self.requested_id.clone().unwrap_or_default();
        let entry = self
            .bound(false)
            .await?
            .ok_or(Error::NotFound(missing))?;
        handler.set_max_idle_secs(entry, secs)
    }

    /// Finish the activity: flush changes and release the session.
    pub async fn complete(mut self) -> Result<()> {
        match self.entry.take() {
            Some(entry) => self.handler.complete(&entry).await,
            None => Ok(()),
        }
    }

    /// Invalidate the session and finish the activity.
    ///
    /// Invalidates the requested id even if it was never bound.
    pub async fn invalidate(mut self) -> Result<()> {
        let entry = self.entry.take();
        let id = entry
            .as_deref()
            .map(|entry| entry.id().to_string())
            .or_else(|| self.requested_id.clone());

        let result = match id {
            Some(id) => self.handler.invalidate(&id).await.map(|_| ()),
            None => Ok(()),
        };
        if let Some(entry) = entry {
            self.handler.complete(&entry).await?;
        }
        result
    }
}

impl Drop for SessionAgent {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            error!(
                session_id = %entry.id(),
                "Session agent dropped without complete() or invalidate(), releasing unflushed"
            );
            self.handler.counters().agent_leaked();
            self.handler.release_abandoned(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionManagerConfig;
    use crate::store::LocalStore;
    use serde::Deserialize;
    use serde_json::json;

    fn handler() -> Arc<SessionHandler> {
        Arc::new(SessionHandler::new(
            &SessionManagerConfig::new(),
            Arc::new(LocalStore),
        ))
    }

    #[tokio::test]
    async fn test_lazy_binding() {
        let handler = handler();
        let mut agent = SessionAgent::new(Arc::clone(&handler), None);
        assert!(agent.session_id().is_none());
        assert_eq!(agent.get_attribute("a").await.unwrap(), None);
        assert!(agent.session_id().is_none());

        agent.set_attribute("a", "1").await.unwrap();
        let id = agent.session_id().unwrap().to_string();
        let info = agent.get_session(false).await.unwrap().unwrap();
        assert_eq!(info.id, id);
        assert!(info.is_new);
        agent.complete().await.unwrap();

        assert_eq!(handler.cache().peek(&id).unwrap().requests(), 0);
    }

    #[tokio::test]
    async fn test_typed_attribute() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Cart {
            items: Vec<String>,
        }

        let mut agent = SessionAgent::new(handler(), None);
        agent
            .set_attribute("cart", json!({"items": ["apple"]}))
            .await
            .unwrap();
        let cart: Cart = agent.get_attribute_as("cart").await.unwrap().unwrap();
        assert_eq!(cart.items, vec!["apple".to_string()]);

        let wrong: Result<Option<u32>> = agent.get_attribute_as("cart").await;
        assert!(matches!(wrong, Err(Error::Serialization(_))));
        agent.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_attribute_names_snapshot() {
        let mut agent = SessionAgent::new(handler(), None);
        agent.set_attribute("a", 1).await.unwrap();
        agent.set_attribute("b", 2).await.unwrap();

        let names = agent.get_attribute_names().await.unwrap();
        agent.set_attribute("c", 3).await.unwrap();

        let mut names: Vec<String> = names.collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        agent.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_max_idle_requires_session() {
        let mut agent = SessionAgent::new(handler(), None);
        assert!(matches!(
            agent.set_max_idle_secs(10).await,
            Err(Error::NotFound(_))
        ));
        agent.get_session(true).await.unwrap();
        agent.set_max_idle_secs(10).await.unwrap();
        assert_eq!(agent.get_session(false).await.unwrap().unwrap().max_idle_secs, 10);
        agent.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_unbound_requested_id() {
        let handler = handler();
        let id = handler.new_session_id();
        let mut creator = SessionAgent::new(Arc::clone(&handler), Some(id.clone()));
        assert_eq!(creator.get_session(true).await.unwrap().unwrap().id, id);
        creator.complete().await.unwrap();

        let agent = SessionAgent::new(Arc::clone(&handler), Some(id.clone()));
        agent.invalidate().await.unwrap();
        assert!(!handler.cache().contains(&id));
    }

    #[tokio::test]
    async fn test_rebinds_after_foreign_invalidate() {
        let handler = handler();
        let id = handler.new_session_id();
        let mut agent = SessionAgent::new(Arc::clone(&handler), Some(id.clone()));
        agent.get_session(true).await.unwrap();

        handler.invalidate(&id).await.unwrap();
        let info = agent.get_session(true).await.unwrap().unwrap();
        assert_ne!(info.id, id);
        assert!(!handler.cache().is_retiring(&id));
        agent.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_requested_id_gets_fresh_session() {
        let handler = handler();
        let mut agent = SessionAgent::new(Arc::clone(&handler), Some("attacker-chosen".to_string()));
        agent.set_attribute("a", 1).await.unwrap();

        let id = agent.session_id().unwrap().to_string();
        assert_ne!(id, "attacker-chosen");
        assert_eq!(agent.requested_id(), Some("attacker-chosen"));
        agent.complete().await.unwrap();
        assert!(!handler.cache().contains("attacker-chosen"));
    }

    #[tokio::test]
    async fn test_drop_without_complete_releases() {
        let handler = handler();
        let mut agent = SessionAgent::new(Arc::clone(&handler), None);
        agent.get_session(true).await.unwrap();
        let id = agent.session_id().unwrap().to_string();
        drop(agent);

        assert_eq!(handler.cache().peek(&id).unwrap().requests(), 0);
        assert_eq!(handler.stats().agents_leaked, 1);
    }
}
