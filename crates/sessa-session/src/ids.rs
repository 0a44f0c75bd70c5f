//! Session id generation and the record of ids handed out before use.
//!
//! An id presented by a client is only ever adopted for a new session if
//! this process generated it and no session has used it yet. Everything
//! else, including ids of sessions that have ended, gets a fresh id.

use dashmap::DashMap;
use tracing::debug;

/// Most unused ids remembered at once.
const MAX_ISSUED: usize = 65_536;

/// Ids generated by [`issue`](IssuedIds::issue) and not yet claimed.
#[derive(Debug)]
pub(crate) struct IssuedIds {
    group_name: String,
    issued: DashMap<String, i64>,
    capacity: usize,
}

impl IssuedIds {
    pub(crate) fn new(group_name: impl Into<String>) -> Self {
        Self::with_capacity(group_name, MAX_ISSUED)
    }

    fn with_capacity(group_name: impl Into<String>, capacity: usize) -> Self {
        Self {
            group_name: group_name.into(),
            issued: DashMap::new(),
            capacity,
        }
    }

    /// A random id, prefixed with the group name if one is set. Not recorded.
    pub(crate) fn generate(&self) -> String {
        let random = uuid::Uuid::new_v4().simple().to_string();
        if self.group_name.is_empty() {
            random
        } else {
            format!("{}.{}", self.group_name, random)
        }
    }

    /// Generate an id and remember it so a later create may adopt it.
    ///
    /// When the record is full even after dropping stale ids the id is
    /// still returned, but a create presenting it gets a fresh one.
    pub(crate) fn issue(&self, now: i64, ttl_ms: i64) -> String {
        let id = self.generate();
        if self.issued.len() >= self.capacity {
            self.prune(now, ttl_ms);
        }
        if self.issued.len() < self.capacity {
            self.issued.insert(id.clone(), now);
        } else {
            debug!(capacity = self.capacity, "Issued session id record full");
        }
        id
    }

    /// Take the right to create a session under `id`. Succeeds once per
    /// issued id, within `ttl_ms` of issuing it.
    pub(crate) fn claim(&self, id: &str, now: i64, ttl_ms: i64) -> bool {
        self.has_group_prefix(id)
            && self
                .issued
                .remove_if(id, |_, issued_at| now - *issued_at < ttl_ms)
                .is_some()
    }

    /// Forget an issued id so it can never be adopted.
    pub(crate) fn revoke(&self, id: &str) -> bool {
        self.issued.remove(id).is_some()
    }

    /// Drop ids issued `ttl_ms` or longer ago. Returns how many went.
    pub(crate) fn prune(&self, now: i64, ttl_ms: i64) -> usize {
        let before = self.issued.len();
        self.issued.retain(|_, issued_at| now - *issued_at < ttl_ms);
        before.saturating_sub(self.issued.len())
    }

    pub(crate) fn has_group_prefix(&self, id: &str) -> bool {
        self.group_name.is_empty()
            || id
                .strip_prefix(self.group_name.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }

    pub(crate) fn len(&self) -> usize {
        self.issued.len()
    }
}
