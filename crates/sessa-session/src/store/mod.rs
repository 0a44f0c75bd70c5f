//! Persistence boundary for session state.
//!
//! [`SessionStore`] is the capability the handler talks to. Two variants
//! exist: [`LocalStore`], which keeps nothing outside the process cache, and
//! [`DistributedStore`], which persists sessions to an external key-value
//! service over pooled connections. [`from_config`] picks one.

mod distributed;
mod memory;
mod pool;
mod redis_kv;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::data::SessionData;
use crate::error::Result;

pub use distributed::DistributedStore;
pub use memory::{MemoryKv, MemoryKvConnection};
pub use pool::{ConnectionPool, PoolState, PooledConnection};
pub use redis_kv::{RedisConnection, RedisConnector};

/// Load, save and delete session state by id.
///
/// Implementations must be safe to call concurrently for different ids.
/// For the same id, last writer wins.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session. Returns `Ok(None)` if absent or expired in the store.
    async fn load(&self, id: &str) -> Result<Option<SessionData>>;

    /// Insert or overwrite a session.
    async fn save(&self, data: &SessionData) -> Result<()>;

    /// Remove a session. Deleting an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Check for a session without decoding it.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Open any resources the store wants ready before traffic arrives.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Short name used in logs.
    fn kind(&self) -> &'static str;
}

/// In-process store: sessions live only in the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStore;

#[async_trait]
impl SessionStore for LocalStore {
    async fn load(&self, _id: &str) -> Result<Option<SessionData>> {
        Ok(None)
    }

    async fn save(&self, _data: &SessionData) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

/// One connection to a key-value backend.
#[async_trait]
pub trait KvConnection: Send {
    /// `GET key`
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `SET key value [EX ttl]`
    async fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()>;

    /// `DEL key`, returning whether a key was removed.
    async fn del(&mut self, key: &str) -> Result<bool>;

    /// `EXISTS key`
    async fn exists(&mut self, key: &str) -> Result<bool>;
}

/// Opens connections to a key-value backend.
#[async_trait]
pub trait KvConnector: Send + Sync + 'static {
    type Connection: KvConnection + 'static;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// Build the store selected by configuration.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn SessionStore>> {
    match config {
        StoreConfig::Local => Ok(Arc::new(LocalStore)),
        StoreConfig::Distributed(settings) => {
            settings.validate()?;
            let connector = RedisConnector::new(&settings.endpoints, settings.io_timeout())?;
            Ok(Arc::new(DistributedStore::new(connector, settings)))
        }
    }
}
