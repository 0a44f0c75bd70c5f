//! Orchestration of cache, store and idle-timeout policy.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, Lookup, Release, SessionCache};
use crate::config::SessionManagerConfig;
use crate::data::{SessionData, now_millis};
use crate::error::{Error, Result};
use crate::ids::IssuedIds;
use crate::stats::{SessionCounters, SessionStats};
use crate::store::SessionStore;

/// Pause between flush attempts, multiplied by the attempt number.
const FLUSH_BACKOFF: Duration = Duration::from_millis(25);

/// How long an issued id stays adoptable when sessions never expire.
const UNEXPIRING_ID_TTL_MS: i64 = 30 * 60 * 1000;

/// What one scavenge pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScavengeReport {
    /// Idle sessions evicted because they expired.
    pub expired: usize,
    /// Held sessions past expiry, flagged to expire on release.
    pub flagged: usize,
    /// Idle dirty sessions flushed on retry.
    pub flushed: usize,
    /// Store deletes that failed and were queued for the next pass.
    pub deletes_failed: usize,
}

impl ScavengeReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Creates, looks up, flushes and invalidates sessions.
///
/// Reads fall through cache then store. Writes go to the cached entry and
/// reach the store when the holding activity completes. A store outage
/// degrades to cache-only sessions rather than failing requests, except when
/// the connection pool is exhausted, which fails the one operation.
pub struct SessionHandler {
    cache: SessionCache,
    store: Arc<dyn SessionStore>,
    counters: Arc<SessionCounters>,
    ids: IssuedIds,
    default_max_idle_secs: AtomicI64,
    save_period_secs: u64,
    flush_attempts: u32,
    pending_deletes: Mutex<HashSet<String>>,
}

impl SessionHandler {
    pub fn new(config: &SessionManagerConfig, store: Arc<dyn SessionStore>) -> Self {
        let counters = Arc::new(SessionCounters::default());
        Self {
            cache: SessionCache::with_counters(Arc::clone(&counters)),
            store,
            counters,
            ids: IssuedIds::new(config.group_name.clone()),
            default_max_idle_secs: AtomicI64::new(config.default_max_idle_secs),
            save_period_secs: config.save_period_secs,
            flush_attempts: config.flush_attempts.max(1),
            pending_deletes: Mutex::new(HashSet::new()),
        }
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Generate an unguessable id, prefixed with the group name if one is set.
    ///
    /// The id is remembered for one default idle window: the first create
    /// presenting it in that window gets a session under it. Ids this
    /// process did not issue are never adopted.
    pub fn new_session_id(&self) -> String {
        self.ids.issue(now_millis(), self.issued_id_ttl_ms())
    }

    fn issued_id_ttl_ms(&self) -> i64 {
        match self.default_max_idle_secs() {
            secs if secs > 0 => secs.saturating_mul(1000),
            _ => UNEXPIRING_ID_TTL_MS,
        }
    }

    pub fn default_max_idle_secs(&self) -> i64 {
        self.default_max_idle_secs.load(Ordering::Relaxed)
    }

    /// Change the idle timeout given to sessions created from now on.
    /// Existing sessions keep their own timeout.
    pub fn set_default_max_idle_secs(&self, secs: i64) {
        self.default_max_idle_secs.store(secs, Ordering::Relaxed);
    }

    /// Find a session and take a hold on it, creating one if asked.
    ///
    /// Looks in the cache, then the store. With `create`, a miss produces a
    /// new session under a fresh id. The requested id is kept only if this
    /// process issued it through [`new_session_id`](Self::new_session_id)
    /// and no session has used it yet. Every returned entry must be handed
    /// back through [`complete`](Self::complete).
    pub async fn get_session(
        &self,
        id: Option<&str>,
        create: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let now = now_millis();

        if let Some(id) = id {
            match self.cache.lookup(id, now) {
                Lookup::Hit(entry) => {
                    entry.with_data_mut(|data| data.touch(now));
                    return Ok(Some(entry));
                }
                Lookup::Expired(data) => {
                    self.pending_deletes.lock().insert(data.id().to_string());
                }
                Lookup::Miss => {}
            }

            if !self.has_ended(id)
                && let Some(entry) = self.load_into_cache(id, now).await?
            {
                return Ok(Some(entry));
            }
        }

        if !create {
            return Ok(None);
        }

        if let Some(id) = id {
            if let Some(entry) = self.adopt_issued(id, now) {
                return Ok(Some(entry));
            }
            debug!(requested_id = %id, "Requested session id not issued here, using a fresh one");
        }

        let data = SessionData::new(self.ids.generate(), self.default_max_idle_secs(), now);
        let (entry, inserted) = self.cache.put_if_absent(data);
        if inserted {
            self.created(&entry);
        }
        Ok(Some(entry))
    }

    /// Create a session under an id this process issued, or join the one a
    /// concurrent activity just created under it. The claim is taken under
    /// the cache's lock for the id, so an invalidate can't slip in between.
    fn adopt_issued(&self, id: &str, now: i64) -> Option<Arc<CacheEntry>> {
        let ttl_ms = self.issued_id_ttl_ms();
        let data = SessionData::new(id, self.default_max_idle_secs(), now);
        let (entry, inserted) = self
            .cache
            .put_if_admitted(data, || self.ids.claim(id, now, ttl_ms))?;
        if inserted {
            self.created(&entry);
        } else {
            entry.with_data_mut(|data| data.touch(now));
        }
        Some(entry)
    }

    fn created(&self, entry: &CacheEntry) {
        entry.set_new(true);
        entry.mark_dirty();
        self.counters.session_created();
        debug!(session_id = %entry.id(), "Session created");
    }

    /// Whether the id belongs to a session invalidated or expired here whose
    /// cleanup is not finished. Such ids are not reloaded from the store.
    fn has_ended(&self, id: &str) -> bool {
        self.cache.is_retiring(id) || self.pending_deletes.lock().contains(id)
    }

    async fn load_into_cache(&self, id: &str, now: i64) -> Result<Option<Arc<CacheEntry>>> {
        let loaded = match self.store.load(id).await {
            Ok(loaded) => loaded,
            Err(e @ Error::PoolExhausted(_)) => return Err(e),
            Err(e) => {
                self.counters.store_failed();
                warn!(
                    session_id = %id,
                    store = self.store.kind(),
                    error = %e,
                    "Session store read failed, continuing without it"
                );
                None
            }
        };

        let Some(mut data) = loaded else {
            return Ok(None);
        };
        data.touch(now);
        let (entry, inserted) = self.cache.put_if_absent(data);
        if inserted {
            debug!(session_id = %id, "Session loaded from store");
        } else {
            entry.with_data_mut(|data| data.touch(now));
        }
        Ok(Some(entry))
    }

    pub fn get_attribute(&self, entry: &CacheEntry, name: &str) -> Result<Option<Value>> {
        ensure_valid(entry)?;
        Ok(entry.with_data(|data| data.attribute(name).cloned()))
    }

    /// Set an attribute and mark the session dirty. `Null` removes it.
    pub fn set_attribute(
        &self,
        entry: &CacheEntry,
        name: &str,
        value: Value,
    ) -> Result<Option<Value>> {
        ensure_valid(entry)?;
        let previous = entry.with_data_mut(|data| data.set_attribute(name, value));
        entry.mark_dirty();
        Ok(previous)
    }

    pub fn remove_attribute(&self, entry: &CacheEntry, name: &str) -> Result<Option<Value>> {
        ensure_valid(entry)?;
        let previous = entry.with_data_mut(|data| data.remove_attribute(name));
        if previous.is_some() {
            entry.mark_dirty();
        }
        Ok(previous)
    }

    pub fn attribute_names(&self, entry: &CacheEntry) -> Result<Vec<String>> {
        ensure_valid(entry)?;
        Ok(entry.with_data(|data| data.attribute_names()))
    }

    /// Override the idle timeout of one session.
    pub fn set_max_idle_secs(&self, entry: &CacheEntry, secs: i64) -> Result<()> {
        ensure_valid(entry)?;
        entry.with_data_mut(|data| data.set_max_idle_secs(secs));
        entry.mark_dirty();
        Ok(())
    }

    /// End an activity's hold on a session, flushing changes first.
    ///
    /// The hold is released even if the flush fails; the session then stays
    /// dirty and the next flush opportunity retries it.
    pub async fn complete(&self, entry: &Arc<CacheEntry>) -> Result<()> {
        let now = now_millis();
        let flushed = if !entry.is_invalid() && self.needs_save(entry, now) {
            self.flush(entry, now).await
        } else {
            Ok(())
        };
        if flushed.is_ok() {
            entry.set_new(false);
        }

        self.release(entry, now).await;
        flushed
    }

    /// Write a session to the store, retrying recoverable failures up to
    /// the configured number of attempts.
    pub async fn flush(&self, entry: &CacheEntry, now: i64) -> Result<()> {
        // Cleared up front so writes racing with the save mark it again.
        let was_dirty = entry.take_dirty();
        let mut snapshot = entry.snapshot();
        snapshot.mark_saved(now);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.save(&snapshot).await {
                Ok(()) => {
                    entry.with_data_mut(|data| data.mark_saved(now));
                    trace!(session_id = %entry.id(), attempt, "Session flushed");
                    if entry.is_invalid() {
                        // Invalidated mid-flush; don't leave the record behind.
                        self.purge_or_queue(entry.id()).await;
                    }
                    return Ok(());
                }
                Err(e) if e.is_recoverable() && attempt < self.flush_attempts => {
                    debug!(session_id = %entry.id(), attempt, error = %e, "Session flush failed, retrying");
                    tokio::time::sleep(FLUSH_BACKOFF * attempt).await;
                }
                Err(e) => {
                    if was_dirty {
                        entry.mark_dirty();
                    }
                    self.counters.store_failed();
                    warn!(
                        session_id = %entry.id(),
                        attempts = attempt,
                        error = %e,
                        "Session flush failed, keeping changes for the next flush"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn needs_save(&self, entry: &CacheEntry, now: i64) -> bool {
        if entry.is_dirty() {
            return true;
        }
        let (last_saved, max_idle) =
            entry.with_data(|data| (data.last_saved_time(), data.max_idle_secs()));
        let period_ms = if self.save_period_secs > 0 {
            i64::try_from(self.save_period_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
        } else if max_idle > 0 {
            max_idle.saturating_mul(500)
        } else {
            return false;
        };
        now - last_saved >= period_ms
    }

    async fn release(&self, entry: &Arc<CacheEntry>, now: i64) {
        if let Release::Expired(data) = self.cache.release(entry, now) {
            self.purge_or_queue(data.id()).await;
        }
    }

    /// Release a hold without flushing, for holders that can't await.
    /// Store cleanup is deferred to the next scavenge pass.
    pub(crate) fn release_abandoned(&self, entry: &Arc<CacheEntry>) {
        if let Release::Expired(data) = self.cache.release(entry, now_millis()) {
            self.pending_deletes.lock().insert(data.id().to_string());
        }
    }

    /// Invalidate a session by id.
    ///
    /// No new lookup can find the session once this returns. Activities
    /// still holding it keep their hold until they complete, but any
    /// attribute access through it fails. The store record is deleted now,
    /// or queued for retry if the store is unreachable. Returns whether the
    /// session was cached.
    pub async fn invalidate(&self, id: &str) -> Result<bool> {
        self.ids.revoke(id);
        let removed = self.cache.remove(id).is_some();
        if removed {
            debug!(session_id = %id, "Session invalidated");
        }
        if let Err(e) = self.store.delete(id).await {
            self.counters.store_failed();
            warn!(session_id = %id, error = %e, "Session store delete failed, queued for retry");
            self.pending_deletes.lock().insert(id.to_string());
        }
        Ok(removed)
    }

    async fn purge_or_queue(&self, id: &str) {
        if let Err(e) = purge(Arc::clone(&self.store), id.to_string()).await {
            warn!(session_id = %id, error = %e, "Session store delete failed, queued for retry");
            self.pending_deletes.lock().insert(id.to_string());
        }
    }

    /// Ids whose store delete failed and is waiting for a retry.
    pub fn pending_deletes(&self) -> Vec<String> {
        self.pending_deletes.lock().iter().cloned().collect()
    }

    /// One scavenge pass: evict idle expired sessions, flag held expired
    /// ones, retry failed flushes and deletes.
    ///
    /// Store deletes run concurrently and the pass waits for them; each is
    /// bounded by the store's own pool and I/O timeouts.
    pub async fn scavenge(&self) -> ScavengeReport {
        let now = now_millis();
        let sweep = self.cache.sweep(now);
        let stale_ids = self.ids.prune(now, self.issued_id_ttl_ms());
        if stale_ids > 0 {
            trace!(stale_ids, outstanding = self.ids.len(), "Dropped unused issued session ids");
        }

        let mut report = ScavengeReport {
            expired: sweep.expired.len(),
            flagged: sweep.flagged,
            ..Default::default()
        };

        let mut ids: Vec<String> = mem::take(&mut *self.pending_deletes.lock())
            .into_iter()
            .collect();
        ids.extend(sweep.expired.iter().map(|data| data.id().to_string()));

        let mut deletes = JoinSet::new();
        for id in ids {
            let store = Arc::clone(&self.store);
            deletes.spawn(async move {
                let result = purge(store, id.clone()).await;
                (id, result)
            });
        }
        while let Some(joined) = deletes.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((id, Err(e))) => {
                    warn!(session_id = %id, error = %e, "Expired session delete failed, retrying next pass");
                    self.pending_deletes.lock().insert(id);
                    report.deletes_failed += 1;
                }
                Err(e) => warn!(error = %e, "Session delete task failed"),
            }
        }

        for entry in sweep.dirty {
            if self.flush(&entry, now).await.is_ok() {
                report.flushed += 1;
            }
        }

        if !report.is_empty() {
            debug!(
                expired = report.expired,
                flagged = report.flagged,
                flushed = report.flushed,
                deletes_failed = report.deletes_failed,
                "Scavenge pass finished"
            );
        }
        report
    }

    /// Flush every dirty cached session. Returns how many were written.
    pub async fn flush_all(&self) -> usize {
        let now = now_millis();
        let mut flushed = 0;
        for entry in self.cache.dirty_entries() {
            if self.flush(&entry, now).await.is_ok() {
                flushed += 1;
            }
        }
        flushed
    }

    pub(crate) fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }
}

/// Delete a record unless a peer already removed it. Returns whether a
/// delete was issued.
async fn purge(store: Arc<dyn SessionStore>, id: String) -> Result<bool> {
    if !store.exists(&id).await? {
        return Ok(false);
    }
    store.delete(&id).await?;
    Ok(true)
}

fn ensure_valid(entry: &CacheEntry) -> Result<()> {
    if entry.is_invalid() {
        return Err(Error::InvalidState(format!(
            "session {} has been invalidated",
            entry.id()
        )));
    }
    Ok(())
}
