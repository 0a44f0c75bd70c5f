//! Observability counters shared by the cache and handler.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time snapshot of the session counters, suitable for external
/// polling or export to a metrics system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Sessions currently held in the cache, including invalidated ones
    /// still waiting for their last holder to leave.
    pub sessions_current: u64,
    /// Highest value `sessions_current` has reached.
    pub sessions_max: u64,
    /// Cumulative number of entries placed in the cache (created or loaded).
    pub sessions_total: u64,
    /// Sessions newly created by this process.
    pub sessions_created: u64,
    /// Sessions evicted because their idle timeout elapsed.
    pub sessions_expired: u64,
    /// Sessions removed by explicit invalidation.
    pub sessions_invalidated: u64,
    /// Agents dropped without calling `complete` or `invalidate`.
    pub agents_leaked: u64,
    /// Store operations that failed after exhausting their attempts.
    pub store_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    current: AtomicU64,
    max: AtomicU64,
    total: AtomicU64,
    created: AtomicU64,
    expired: AtomicU64,
    invalidated: AtomicU64,
    agents_leaked: AtomicU64,
    store_failures: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn entry_added(&self) {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(current, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn entry_replaced(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn entry_removed(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn session_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_invalidated(&self) {
        self.invalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn agent_leaked(&self) {
        self.agents_leaked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn store_failed(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub(crate) fn max(&self) -> u64 {
        self.max.load(Ordering::SeqCst)
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            sessions_current: self.current(),
            sessions_max: self.max(),
            sessions_total: self.total(),
            sessions_created: self.created.load(Ordering::Relaxed),
            sessions_expired: self.expired.load(Ordering::Relaxed),
            sessions_invalidated: self.invalidated.load(Ordering::Relaxed),
            agents_leaked: self.agents_leaked.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}
