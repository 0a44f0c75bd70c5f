//! Session store backed by an external key-value service.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ConnectionPool, KvConnection, KvConnector, SessionStore};
use crate::config::DistributedStoreConfig;
use crate::data::{SessionData, now_millis};
use crate::error::Result;

/// Persists sessions as JSON payloads keyed by `key_prefix + id`.
///
/// Every operation borrows one pooled connection for its duration. A
/// connection that fails mid-command is discarded rather than reused.
pub struct DistributedStore<C: KvConnector> {
    pool: ConnectionPool<C>,
    key_prefix: String,
}

impl<C: KvConnector> DistributedStore<C> {
    pub fn new(connector: C, config: &DistributedStoreConfig) -> Self {
        Self {
            pool: ConnectionPool::new(
                connector,
                config.pool_min_idle,
                config.pool_max_total,
                config.borrow_timeout(),
            ),
            key_prefix: config.key_prefix.clone(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Backend key for a session id.
    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

/// Seconds the backend should keep a record: whatever remains of the idle
/// window, at least one second. `None` for sessions that never expire.
fn ttl_secs(data: &SessionData, now: i64) -> Option<u64> {
    data.expiry()
        .map(|expiry| u64::try_from((expiry - now) / 1000).unwrap_or(0).max(1))
}

#[async_trait]
impl<C: KvConnector> SessionStore for DistributedStore<C> {
    async fn load(&self, id: &str) -> Result<Option<SessionData>> {
        let key = self.key(id);
        let mut conn = self.pool.get().await?;
        let Some(payload) = conn.get(&key).await.inspect_err(|_| conn.mark_broken())? else {
            return Ok(None);
        };

        let data: SessionData = match serde_json::from_slice(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Discarding undecodable session record");
                conn.del(&key).await.inspect_err(|_| conn.mark_broken())?;
                return Err(e.into());
            }
        };

        if data.is_expired_at(now_millis()) {
            debug!(session_id = %id, "Stored session already expired, removing");
            conn.del(&key).await.inspect_err(|_| conn.mark_broken())?;
            return Ok(None);
        }

        Ok(Some(data))
    }

    async fn save(&self, data: &SessionData) -> Result<()> {
        let key = self.key(data.id());
        let payload = serde_json::to_vec(data)?;
        let ttl = ttl_secs(data, now_millis());

        let mut conn = self.pool.get().await?;
        conn.set(&key, &payload, ttl)
            .await
            .inspect_err(|_| conn.mark_broken())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let key = self.key(id);
        let mut conn = self.pool.get().await?;
        conn.del(&key).await.inspect_err(|_| conn.mark_broken())?;
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let key = self.key(id);
        let mut conn = self.pool.get().await?;
        conn.exists(&key).await.inspect_err(|_| conn.mark_broken())
    }

    async fn start(&self) -> Result<()> {
        let opened = self.pool.warm_up().await;
        info!(connections = opened, "Distributed session store ready");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "distributed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryKv;
    use serde_json::json;
    use std::time::Duration;

    fn store(kv: &MemoryKv) -> DistributedStore<MemoryKv> {
        let config = DistributedStoreConfig::new(["memory"])
            .with_pool(1, 2)
            .with_borrow_timeout(Duration::from_millis(100));
        DistributedStore::new(kv.clone(), &config)
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let kv = MemoryKv::new();
        let store = store(&kv);

        let mut data = SessionData::new("app.1", 60, now_millis());
        data.set_attribute("a", json!("1"));
        data.set_attribute("b", json!({"nested": [1, 2]}));
        store.save(&data).await.unwrap();

        let loaded = store.load("app.1").await.unwrap().unwrap();
        assert_eq!(loaded.attributes(), data.attributes());
        assert_eq!(loaded.id(), "app.1");
        assert!(store.exists("app.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_mirrors_idle_timeout() {
        let kv = MemoryKv::new();
        let store = store(&kv);

        store
            .save(&SessionData::new("s1", 120, now_millis()))
            .await
            .unwrap();
        let ttl = kv.ttl("session:s1").unwrap();
        assert!(ttl > Duration::from_secs(100) && ttl <= Duration::from_secs(120));

        store
            .save(&SessionData::new("s2", 0, now_millis()))
            .await
            .unwrap();
        assert!(kv.ttl("session:s2").is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let kv = MemoryKv::new();
        let store = store(&kv);

        store.save(&SessionData::new("s1", 60, now_millis())).await.unwrap();
        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(!store.exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_skips_expired_record() {
        let kv = MemoryKv::new();
        let store = store(&kv);

        let stale = SessionData::new("s1", 1, now_millis() - 10_000);
        let payload = serde_json::to_vec(&stale).unwrap();
        let mut conn = kv.connect().await.unwrap();
        conn.set("session:s1", &payload, None).await.unwrap();

        assert!(store.load("s1").await.unwrap().is_none());
        assert!(kv.raw("session:s1").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_removed() {
        let kv = MemoryKv::new();
        let store = store(&kv);
        let mut conn = kv.connect().await.unwrap();
        conn.set("session:s1", b"not json", None).await.unwrap();

        assert!(matches!(store.load("s1").await, Err(Error::Serialization(_))));
        assert!(kv.raw("session:s1").is_none());
    }

    #[tokio::test]
    async fn test_outage_reported_and_connection_discarded() {
        let kv = MemoryKv::new();
        let store = store(&kv);
        store.start().await.unwrap();
        assert_eq!(store.pool().state().idle, 1);

        kv.set_offline(true);
        let err = store.load("s1").await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(store.pool().state().idle, 0);
        assert_eq!(store.pool().state().in_use, 0);
    }
}
