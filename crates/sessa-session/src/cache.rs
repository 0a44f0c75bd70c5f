//! In-memory session cache with holder counting.
//!
//! The cache is the single in-process authority for a session id. Each entry
//! counts the activities currently holding it; an entry with holders is never
//! evicted. Invalidated entries leave the lookup index at once but stay
//! parked until their last holder releases them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::data::SessionData;
use crate::stats::{SessionCounters, SessionStats};

/// A cached session plus its bookkeeping.
#[derive(Debug)]
pub struct CacheEntry {
    id: String,
    data: Mutex<SessionData>,
    requests: AtomicUsize,
    dirty: AtomicBool,
    invalid: AtomicBool,
    expire_on_release: AtomicBool,
    new: AtomicBool,
}

impl CacheEntry {
    fn new(data: SessionData) -> Self {
        Self {
            id: data.id().to_string(),
            data: Mutex::new(data),
            requests: AtomicUsize::new(1),
            dirty: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            expire_on_release: AtomicBool::new(false),
            new: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of activities currently holding this entry.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Whether the entry has changes not yet flushed to the store.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Whether the entry has been invalidated or evicted.
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    /// Whether the scavenger found this entry expired while it was held.
    pub fn is_expire_on_release(&self) -> bool {
        self.expire_on_release.load(Ordering::SeqCst)
    }

    /// Whether the session was created by this process and no activity
    /// using it has completed yet.
    pub fn is_new(&self) -> bool {
        self.new.load(Ordering::SeqCst)
    }

    /// Run `f` against the session data.
    pub fn with_data<R>(&self, f: impl FnOnce(&SessionData) -> R) -> R {
        f(&self.data.lock())
    }

    /// Clone of the current session data.
    pub fn snapshot(&self) -> SessionData {
        self.data.lock().clone()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.data.lock().is_expired_at(now)
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut SessionData) -> R) -> R {
        f(&mut self.data.lock())
    }

    pub(crate) fn set_new(&self, new: bool) {
        self.new.store(new, Ordering::SeqCst);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Clear the dirty flag. Returns `false` if it was already clear.
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.expire_on_release.store(false, Ordering::SeqCst);
    }

    fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    fn is_idle_and_expired(&self, now: i64) -> bool {
        self.requests() == 0 && self.is_expired_at(now)
    }
}

/// Outcome of releasing a holder.
#[derive(Debug)]
pub enum Release {
    /// The entry is still cached, with or without other holders.
    Retained,
    /// The last holder left an invalidated entry; it is gone from the cache.
    Retired,
    /// The last holder left an entry that had expired while held. The caller
    /// should delete the returned session from the store.
    Expired(SessionData),
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// A live entry, now held by the caller.
    Hit(Arc<CacheEntry>),
    /// The entry was idle past its expiry and has been evicted. The caller
    /// should delete the returned session from the store.
    Expired(SessionData),
    Miss,
}

/// Result of sweeping the cache for idle sessions.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Sessions evicted because they expired while idle.
    pub expired: Vec<SessionData>,
    /// Held sessions past their expiry, flagged to expire on release.
    pub flagged: usize,
    /// Idle, unexpired sessions with unflushed changes.
    pub dirty: Vec<Arc<CacheEntry>>,
}

/// Concurrent map from session id to cached entry.
#[derive(Debug)]
pub struct SessionCache {
    index: DashMap<String, Arc<CacheEntry>>,
    retiring: DashMap<String, Arc<CacheEntry>>,
    counters: Arc<SessionCounters>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCache {
    pub fn new() -> Self {
        Self::with_counters(Arc::new(SessionCounters::default()))
    }

    pub(crate) fn with_counters(counters: Arc<SessionCounters>) -> Self {
        Self {
            index: DashMap::new(),
            retiring: DashMap::new(),
            counters,
        }
    }

    /// Look up a live session and take a hold on it.
    ///
    /// Returns `None` if the id is unknown, or if the entry is idle and past
    /// its expiry (in which case it is evicted here). The store is not
    /// consulted. Every `Some` must be paired with a [`release`](Self::release).
    pub fn get(&self, id: &str, now: i64) -> Option<Arc<CacheEntry>> {
        match self.lookup(id, now) {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Expired(_) | Lookup::Miss => None,
        }
    }

    /// Like [`get`](Self::get), but reports an eviction so the caller can
    /// clean up the store record.
    pub fn lookup(&self, id: &str, now: i64) -> Lookup {
        {
            let Some(cached) = self.index.get(id) else {
                return Lookup::Miss;
            };
            let entry = cached.value();
            if !entry.is_idle_and_expired(now) {
                entry.acquire();
                trace!(session_id = %id, requests = entry.requests(), "Session cache hit");
                return Lookup::Hit(Arc::clone(entry));
            }
        }

        match self
            .index
            .remove_if(id, |_, entry| entry.is_idle_and_expired(now))
        {
            Some((_, entry)) => {
                entry.mark_invalid();
                self.counters.entry_removed();
                self.counters.session_expired();
                debug!(session_id = %id, "Expired session evicted on lookup");
                Lookup::Expired(entry.snapshot())
            }
            None => Lookup::Miss,
        }
    }

    /// Insert or replace an entry. The caller becomes its single holder.
    pub fn put(&self, data: SessionData) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry::new(data));
        match self.index.insert(entry.id.clone(), Arc::clone(&entry)) {
            Some(replaced) => {
                replaced.mark_invalid();
                self.counters.entry_replaced();
            }
            None => self.counters.entry_added(),
        }
        entry
    }

    /// Insert `data` unless a live entry for its id already exists, in which
    /// case a hold is taken on the existing entry instead.
    ///
    /// Returns the held entry and whether `data` was inserted.
    pub fn put_if_absent(&self, data: SessionData) -> (Arc<CacheEntry>, bool) {
        match self.index.entry(data.id().to_string()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                entry.acquire();
                (Arc::clone(entry), false)
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(CacheEntry::new(data));
                vacant.insert(Arc::clone(&entry));
                self.counters.entry_added();
                (entry, true)
            }
        }
    }

    /// Like [`put_if_absent`](Self::put_if_absent), but an absent id is only
    /// inserted if `admit` agrees. `admit` runs under the index lock for
    /// the id, so no other insert or removal of it can interleave.
    ///
    /// Returns `None` if the id was absent and `admit` refused.
    pub fn put_if_admitted(
        &self,
        data: SessionData,
        admit: impl FnOnce() -> bool,
    ) -> Option<(Arc<CacheEntry>, bool)> {
        match self.index.entry(data.id().to_string()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                entry.acquire();
                Some((Arc::clone(entry), false))
            }
            Entry::Vacant(vacant) => {
                if !admit() {
                    return None;
                }
                let entry = Arc::new(CacheEntry::new(data));
                vacant.insert(Arc::clone(&entry));
                self.counters.entry_added();
                Some((entry, true))
            }
        }
    }

    /// Drop a hold taken by [`get`](Self::get) or a put.
    ///
    /// # Panics
    ///
    /// Panics if the entry has no holders: a double release is a lifecycle
    /// bug in the caller and must not be masked.
    pub fn release(&self, entry: &Arc<CacheEntry>, now: i64) -> Release {
        let previous = entry
            .requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Err(_) => panic!(
                "session {} released more times than it was acquired",
                entry.id
            ),
            Ok(n) if n > 1 => return Release::Retained,
            Ok(_) => {}
        }

        if entry.is_invalid() {
            if self.retire(entry) {
                return Release::Retired;
            }
            return Release::Retained;
        }

        if entry.is_expire_on_release()
            && let Some((_, evicted)) = self.index.remove_if(&entry.id, |_, cached| {
                Arc::ptr_eq(cached, entry) && cached.is_idle_and_expired(now)
            })
        {
            evicted.mark_invalid();
            self.counters.entry_removed();
            self.counters.session_expired();
            debug!(session_id = %entry.id, "Session expired on release");
            return Release::Expired(evicted.snapshot());
        }

        Release::Retained
    }

    /// Remove an entry from the lookup index regardless of holders.
    ///
    /// The entry is marked invalid so no new lookup can find it. If it still
    /// has holders it stays parked until the last one releases it. Returns
    /// the removed data so the caller can delete it from the store.
    pub fn remove(&self, id: &str) -> Option<SessionData> {
        let (_, entry) = self.index.remove(id)?;
        entry.mark_invalid();
        self.counters.session_invalidated();

        // Park before checking holders so a concurrent release always finds it.
        self.retiring.insert(entry.id.clone(), Arc::clone(&entry));
        if entry.requests() == 0 {
            self.retire(&entry);
        } else {
            debug!(
                session_id = %id,
                requests = entry.requests(),
                "Invalidated session waiting for holders to release"
            );
        }
        Some(entry.snapshot())
    }

    fn retire(&self, entry: &Arc<CacheEntry>) -> bool {
        let removed = self
            .retiring
            .remove_if(&entry.id, |_, parked| {
                Arc::ptr_eq(parked, entry) && parked.requests() == 0
            })
            .is_some();
        if removed {
            self.counters.entry_removed();
            debug!(session_id = %entry.id, "Invalidated session retired from cache");
        }
        removed
    }

    /// Evict idle expired entries and flag held expired ones.
    ///
    /// Entries are re-checked under the map lock at removal time, so an
    /// access racing with the sweep keeps its session.
    pub fn sweep(&self, now: i64) -> Sweep {
        let snapshot: Vec<Arc<CacheEntry>> = self
            .index
            .iter()
            .map(|cached| Arc::clone(cached.value()))
            .collect();

        let mut sweep = Sweep::default();
        for entry in snapshot {
            if entry.requests() > 0 {
                if entry.is_expired_at(now) {
                    entry.expire_on_release.store(true, Ordering::SeqCst);
                    sweep.flagged += 1;
                }
                continue;
            }

            if !entry.is_expired_at(now) {
                if entry.is_dirty() {
                    sweep.dirty.push(entry);
                }
                continue;
            }

            if let Some((_, evicted)) = self.index.remove_if(&entry.id, |_, cached| {
                Arc::ptr_eq(cached, &entry) && cached.is_idle_and_expired(now)
            }) {
                evicted.mark_invalid();
                self.counters.entry_removed();
                self.counters.session_expired();
                sweep.expired.push(evicted.snapshot());
            }
        }
        sweep
    }

    /// Look up an entry without taking a hold.
    pub fn peek(&self, id: &str) -> Option<Arc<CacheEntry>> {
        self.index.get(id).map(|cached| Arc::clone(cached.value()))
    }

    /// Whether the id is live in the lookup index.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Whether the id belongs to an invalidated entry still waiting for holders.
    pub fn is_retiring(&self, id: &str) -> bool {
        self.retiring.contains_key(id)
    }

    /// Live entries with unflushed changes.
    pub fn dirty_entries(&self) -> Vec<Arc<CacheEntry>> {
        self.index
            .iter()
            .filter(|cached| cached.value().is_dirty())
            .map(|cached| Arc::clone(cached.value()))
            .collect()
    }

    /// Ids currently in the lookup index.
    pub fn ids(&self) -> Vec<String> {
        self.index.iter().map(|cached| cached.key().clone()).collect()
    }

    pub fn sessions_current(&self) -> u64 {
        self.counters.current()
    }

    pub fn sessions_max(&self) -> u64 {
        self.counters.max()
    }

    pub fn sessions_total(&self) -> u64 {
        self.counters.total()
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }
}
