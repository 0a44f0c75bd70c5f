//! Session state value object.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Identity, timestamps and attributes of one session.
///
/// Accessors are public; mutation is reserved to the handler so every change
/// goes through the cache's dirty tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    id: String,
    creation_time: i64,
    last_accessed_time: i64,
    #[serde(default)]
    last_saved_time: i64,
    max_idle_secs: i64,
    #[serde(default)]
    attributes: HashMap<String, Value>,
}

impl SessionData {
    /// Create a fresh session created and accessed at `now` (epoch millis).
    pub fn new(id: impl Into<String>, max_idle_secs: i64, now: i64) -> Self {
        Self {
            id: id.into(),
            creation_time: now,
            last_accessed_time: now,
            last_saved_time: 0,
            max_idle_secs,
            attributes: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creation_time(&self) -> i64 {
        self.creation_time
    }

    pub fn last_accessed_time(&self) -> i64 {
        self.last_accessed_time
    }

    /// When the session was last written to the store, `0` if never.
    pub fn last_saved_time(&self) -> i64 {
        self.last_saved_time
    }

    pub fn max_idle_secs(&self) -> i64 {
        self.max_idle_secs
    }

    /// Instant (epoch millis) at which the session expires, or `None` if
    /// expiry is disabled.
    pub fn expiry(&self) -> Option<i64> {
        (self.max_idle_secs > 0)
            .then(|| self.last_accessed_time + self.max_idle_secs.saturating_mul(1000))
    }

    /// Whether the session has passed its expiry at `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry().is_some_and(|expiry| now >= expiry)
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    pub(crate) fn touch(&mut self, now: i64) {
        // Clock skew between nodes must never move the access time backwards.
        self.last_accessed_time = self.last_accessed_time.max(now);
    }

    pub(crate) fn mark_saved(&mut self, now: i64) {
        self.last_saved_time = now;
    }

    pub(crate) fn set_max_idle_secs(&mut self, secs: i64) {
        self.max_idle_secs = secs;
    }

    /// Set an attribute, returning the previous value. `Null` removes it.
    pub(crate) fn set_attribute(&mut self, name: &str, value: Value) -> Option<Value> {
        if value.is_null() {
            self.attributes.remove(name)
        } else {
            self.attributes.insert(name.to_string(), value)
        }
    }

    pub(crate) fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }
}
