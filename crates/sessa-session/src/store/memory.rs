//! In-process key-value backend.
//!
//! Behaves like the remote service the distributed store talks to, TTLs
//! included, so the distributed code path can run without a network. An
//! `offline` switch makes every call fail as if the service were down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KvConnection, KvConnector};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<HashMap<String, Slot>>,
    offline: AtomicBool,
    connects: AtomicUsize,
}

/// Shared in-memory key-value service. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    shared: Arc<Shared>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the service going down (`true`) or coming back (`false`).
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.shared.offline.load(Ordering::SeqCst)
    }

    /// Number of connections opened so far.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shared
            .entries
            .lock()
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw value for a key, bypassing the offline switch.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.shared
            .entries
            .lock()
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    /// Remaining TTL for a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.shared
            .entries
            .lock()
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

#[async_trait]
impl KvConnector for MemoryKv {
    type Connection = MemoryKvConnection;

    async fn connect(&self) -> Result<MemoryKvConnection> {
        if self.is_offline() {
            return Err(Error::StoreUnavailable(
                "memory kv is offline".to_string(),
            ));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryKvConnection {
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Connection to a [`MemoryKv`].
#[derive(Debug)]
pub struct MemoryKvConnection {
    shared: Arc<Shared>,
}

impl MemoryKvConnection {
    fn check_online(&self) -> Result<()> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "memory kv is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KvConnection for MemoryKvConnection {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.shared.entries.lock();
        if let Some(slot) = entries.get(key)
            && slot.is_live(now)
        {
            return Ok(Some(slot.value.clone()));
        }
        entries.remove(key);
        Ok(None)
    }

    async fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        self.check_online()?;
        let slot = Slot {
            value: value.to_vec(),
            expires_at: ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs)),
        };
        self.shared.entries.lock().insert(key.to_string(), slot);
        Ok(())
    }

    async fn del(&mut self, key: &str) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .shared
            .entries
            .lock()
            .remove(key)
            .is_some_and(|slot| slot.is_live(now)))
    }

    async fn exists(&mut self, key: &str) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .shared
            .entries
            .lock()
            .get(key)
            .is_some_and(|slot| slot.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_commands() {
        let kv = MemoryKv::new();
        let mut conn = kv.connect().await.unwrap();

        conn.set("a", b"1", None).await.unwrap();
        assert_eq!(conn.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(conn.exists("a").await.unwrap());

        assert!(conn.del("a").await.unwrap());
        assert!(!conn.del("a").await.unwrap());
        assert_eq!(conn.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expires_keys() {
        let kv = MemoryKv::new();
        let mut conn = kv.connect().await.unwrap();
        conn.set("a", b"1", Some(0)).await.unwrap();
        assert!(!conn.exists("a").await.unwrap());
        assert_eq!(conn.get("a").await.unwrap(), None);

        conn.set("b", b"2", Some(60)).await.unwrap();
        assert!(kv.ttl("b").unwrap() > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_offline_fails_commands() {
        let kv = MemoryKv::new();
        let mut conn = kv.connect().await.unwrap();
        kv.set_offline(true);

        assert!(matches!(
            conn.get("a").await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(kv.connect().await.is_err());

        kv.set_offline(false);
        assert!(conn.get("a").await.unwrap().is_none());
    }
}
