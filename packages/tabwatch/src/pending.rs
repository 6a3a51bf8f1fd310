//! Durable list of subjects that still need tracking.
//!
//! The whole list lives under a single key and is always rewritten as a
//! whole. Entries carry their own expiry so that subjects whose every
//! instance went away are eventually forgotten.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{Clock, duration_ms};
use crate::store::SharedStore;
use crate::subject::SubjectId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub subject_id: SubjectId,
    /// Unix milliseconds.
    pub expires_at: i64,
}

pub struct PendingRegistry {
    store: Arc<dyn SharedStore>,
    key: String,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl PendingRegistry {
    pub fn new(
        store: Arc<dyn SharedStore>,
        key: String,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key,
            clock,
            ttl,
        }
    }

    /// Insert `id`, or push its expiry forward if already present.
    pub fn add(&self, id: &SubjectId) {
        let mut entries = self.live_entries();
        let expires_at = self.expiry();
        match entries.iter_mut().find(|e| e.subject_id == *id) {
            Some(entry) => entry.expires_at = expires_at,
            None => entries.push(PendingEntry {
                subject_id: id.clone(),
                expires_at,
            }),
        }
        debug!(subject = %id, "pending entry added");
        self.persist(&entries);
    }

    pub fn remove(&self, id: &SubjectId) {
        let mut entries = self.live_entries();
        let before = entries.len();
        entries.retain(|e| e.subject_id != *id);
        if entries.len() != before {
            debug!(subject = %id, "pending entry removed");
        }
        self.persist(&entries);
    }

    /// Extend `id`'s expiry and rewrite the still-valid set. Returns `false`
    /// if `id` is not (or no longer) pending.
    pub fn refresh_ttl(&self, id: &SubjectId) -> bool {
        let mut entries = self.live_entries();
        let expires_at = self.expiry();
        let found = match entries.iter_mut().find(|e| e.subject_id == *id) {
            Some(entry) => {
                entry.expires_at = expires_at;
                true
            }
            None => false,
        };
        self.persist(&entries);
        found
    }

    /// Ids that are still pending. Expired entries are dropped from the
    /// store as a side effect.
    pub fn list(&self) -> Vec<SubjectId> {
        self.entries().into_iter().map(|e| e.subject_id).collect()
    }

    /// Like [`list`](Self::list), with expiry times.
    pub fn entries(&self) -> Vec<PendingEntry> {
        let stored = self.load();
        let live = self.without_expired(stored.clone());
        if live.len() != stored.len() {
            debug!(pruned = stored.len() - live.len(), "pruned expired pending entries");
            self.persist(&live);
        }
        live
    }

    pub fn contains(&self, id: &SubjectId) -> bool {
        self.live_entries().iter().any(|e| e.subject_id == *id)
    }

    fn expiry(&self) -> i64 {
        self.clock.now_ms().saturating_add(duration_ms(self.ttl))
    }

    fn live_entries(&self) -> Vec<PendingEntry> {
        self.without_expired(self.load())
    }

    fn without_expired(&self, mut entries: Vec<PendingEntry>) -> Vec<PendingEntry> {
        let now = self.clock.now_ms();
        entries.retain(|e| e.expires_at > now);
        entries
    }

    fn load(&self) -> Vec<PendingEntry> {
        let Some(raw) = self.store.get(&self.key) else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key = %self.key, error = %e, "ignoring malformed pending registry");
                Vec::new()
            }
        }
    }

    fn persist(&self, entries: &[PendingEntry]) {
        let result = if entries.is_empty() {
            self.store.remove(&self.key)
        } else {
            match serde_json::to_string(entries) {
                Ok(raw) => self.store.set(&self.key, &raw),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "failed to encode pending registry");
                    return;
                }
            }
        };
        if let Err(e) = result {
            warn!(key = %self.key, error = %e, "failed to persist pending registry");
        }
    }
}
