//! Bounded connection pool with scoped acquisition.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use super::KvConnector;
use crate::error::{Error, Result};

/// Counts describing the pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Connections parked and ready for reuse.
    pub idle: usize,
    /// Connections currently borrowed.
    pub in_use: usize,
    /// Upper bound on open connections.
    pub max_total: usize,
}

/// Pool of connections opened by a [`KvConnector`].
///
/// At most `max_total` connections are borrowed at once. Borrowers wait up to
/// the borrow timeout for a slot, then fail with [`Error::PoolExhausted`].
pub struct ConnectionPool<C: KvConnector> {
    connector: C,
    idle: Mutex<Vec<C::Connection>>,
    permits: Arc<Semaphore>,
    min_idle: usize,
    max_total: usize,
    borrow_timeout: Duration,
}

impl<C: KvConnector> ConnectionPool<C> {
    pub fn new(connector: C, min_idle: usize, max_total: usize, borrow_timeout: Duration) -> Self {
        let max_total = max_total.max(1);
        Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(max_total)),
            permits: Arc::new(Semaphore::new(max_total)),
            min_idle: min_idle.min(max_total),
            max_total,
            borrow_timeout,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Borrow a connection, reusing an idle one or opening a new one.
    ///
    /// The connection goes back to the pool when the guard is dropped, on
    /// every exit path, unless it was marked broken.
    pub async fn get(&self) -> Result<PooledConnection<'_, C>> {
        let permit = tokio::time::timeout(
            self.borrow_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| Error::PoolExhausted(self.borrow_timeout))?
        .map_err(|_| Error::StoreUnavailable("connection pool closed".to_string()))?;

        let reused = self.idle.lock().pop();
        let connection = match reused {
            Some(connection) => {
                trace!("Reusing pooled connection");
                connection
            }
            None => {
                debug!("Opening new pooled connection");
                self.connector.connect().await?
            }
        };

        Ok(PooledConnection {
            pool: self,
            connection: Some(connection),
            broken: false,
            _permit: permit,
        })
    }

    /// Open connections until `min_idle` are parked. Failures are logged and
    /// leave the pool to open connections lazily.
    pub async fn warm_up(&self) -> usize {
        let mut opened = 0;
        while self.idle_len() < self.min_idle {
            match self.connector.connect().await {
                Ok(connection) => {
                    self.idle.lock().push(connection);
                    opened += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to pre-open pooled connection");
                    break;
                }
            }
        }
        opened
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            idle: self.idle_len(),
            in_use: self.max_total - self.permits.available_permits(),
            max_total: self.max_total,
        }
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    fn give_back(&self, connection: C::Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_total {
            idle.push(connection);
        }
    }
}

/// A borrowed connection. Returned to its pool on drop.
pub struct PooledConnection<'a, C: KvConnector> {
    pool: &'a ConnectionPool<C>,
    connection: Option<C::Connection>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: KvConnector> PooledConnection<'_, C> {
    /// Discard the connection on drop instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<C: KvConnector> Deref for PooledConnection<'_, C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the connection out.
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl<C: KvConnector> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl<C: KvConnector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if self.broken {
                debug!("Discarding broken pooled connection");
            } else {
                self.pool.give_back(connection);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvConnection, MemoryKv};

    fn pool(kv: &MemoryKv, max_total: usize, timeout_ms: u64) -> ConnectionPool<MemoryKv> {
        ConnectionPool::new(kv.clone(), 1, max_total, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_connection_returned_on_drop() {
        let kv = MemoryKv::new();
        let pool = pool(&kv, 2, 100);
        {
            let mut conn = pool.get().await.unwrap();
            conn.set("k", b"v", None).await.unwrap();
            assert_eq!(pool.state().in_use, 1);
        }
        assert_eq!(pool.state(), PoolState { idle: 1, in_use: 0, max_total: 2 });

        // Reused, not reopened
        let _conn = pool.get().await.unwrap();
        assert_eq!(kv.connects(), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_discarded() {
        let kv = MemoryKv::new();
        let pool = pool(&kv, 2, 100);
        {
            let mut conn = pool.get().await.unwrap();
            conn.mark_broken();
        }
        assert_eq!(pool.state().idle, 0);
        assert_eq!(pool.state().in_use, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let kv = MemoryKv::new();
        let pool = pool(&kv, 1, 50);
        let _held = pool.get().await.unwrap();

        let err = pool.get().await.err().unwrap();
        assert!(matches!(err, Error::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let kv = MemoryKv::new();
        let pool = Arc::new(pool(&kv, 1, 1_000));
        let held = pool.get().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_warm_up_fills_min_idle() {
        let kv = MemoryKv::new();
        let pool = ConnectionPool::new(kv.clone(), 2, 4, Duration::from_millis(100));
        assert_eq!(pool.warm_up().await, 2);
        assert_eq!(pool.state().idle, 2);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slot() {
        let kv = MemoryKv::new();
        kv.set_offline(true);
        let pool = pool(&kv, 1, 50);
        assert!(matches!(
            pool.get().await.err().unwrap(),
            Error::StoreUnavailable(_)
        ));

        kv.set_offline(false);
        assert!(pool.get().await.is_ok());
    }
}
