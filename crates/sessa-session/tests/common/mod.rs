//! Common test utilities for integration tests.

use std::sync::Arc;
use std::time::Duration;

use sessa_session::store::{DistributedStore, MemoryKv};
use sessa_session::{DistributedStoreConfig, SessionManager, SessionManagerConfig};

/// Manager backed by the in-process store.
pub fn local_manager(config: SessionManagerConfig) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(config).expect("valid config"))
}

/// Manager backed by a distributed store over `kv`. Several managers built
/// over clones of the same `kv` behave like processes sharing a backend.
pub fn distributed_manager(kv: &MemoryKv, config: SessionManagerConfig) -> Arc<SessionManager> {
    let store_config = DistributedStoreConfig::new(["memory"])
        .with_pool(1, 8)
        .with_borrow_timeout(Duration::from_millis(500));
    let store = DistributedStore::new(kv.clone(), &store_config);
    Arc::new(SessionManager::with_store(config, Arc::new(store)))
}

/// Poll `check` until it holds or `deadline` passes.
pub async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
