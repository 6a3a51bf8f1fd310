//! Best-effort per-subject leases over a shared store.
//!
//! The store offers no compare-and-swap, so acquisition is read, write,
//! wait, re-read. Two instances can still both believe they won inside a
//! very small window; the loser notices on its next ownership check and
//! steps down.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{Clock, duration_ms};
use crate::store::SharedStore;
use crate::subject::{Keyspace, SubjectId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub subject_id: SubjectId,
    pub owner_id: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

impl LeaseRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    pub fn is_live_for(&self, owner_id: &str, now_ms: i64) -> bool {
        self.owner_id == owner_id && !self.is_expired(now_ms)
    }
}

/// Delays used around the non-atomic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireTiming {
    /// Upper bound of the random pause before writing.
    pub jitter: Duration,
    /// Pause between writing and confirming.
    pub stabilize: Duration,
}

impl Default for AcquireTiming {
    fn default() -> Self {
        Self {
            jitter: Duration::from_millis(60),
            stabilize: Duration::from_millis(50),
        }
    }
}

pub struct LeaseManager {
    store: Arc<dyn SharedStore>,
    keys: Keyspace,
    clock: Arc<dyn Clock>,
    timing: AcquireTiming,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: Keyspace,
        clock: Arc<dyn Clock>,
        timing: AcquireTiming,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            timing,
        }
    }

    /// The stored record, expired or not.
    pub fn current(&self, id: &SubjectId) -> Option<LeaseRecord> {
        let raw = self.store.get(&self.keys.lease_key(id))?;
        parse_record(&raw)
    }

    /// Owner of a non-expired lease, if any.
    pub fn live_owner(&self, id: &SubjectId) -> Option<String> {
        let now = self.clock.now_ms();
        self.current(id)
            .filter(|r| !r.is_expired(now))
            .map(|r| r.owner_id)
    }

    pub fn is_held_by(&self, id: &SubjectId, owner_id: &str) -> bool {
        if !self.store.is_available() {
            return true;
        }
        let now = self.clock.now_ms();
        self.current(id).is_some_and(|r| r.is_live_for(owner_id, now))
    }

    /// Try to become the owner. `true` only if our write was still there
    /// after the stabilization pause.
    pub async fn acquire(&self, id: &SubjectId, owner_id: &str, ttl: Duration) -> bool {
        if !self.store.is_available() {
            return true;
        }

        let jitter_ms = duration_ms(self.timing.jitter).max(0) as u64;
        let pause = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        tokio::time::sleep(pause).await;

        let now = self.clock.now_ms();
        if let Some(record) = self.current(id) {
            if record.owner_id != owner_id && !record.is_expired(now) {
                debug!(subject = %id, holder = %record.owner_id, "lease held elsewhere");
                return false;
            }
        }

        if !self.write(id, owner_id, now, ttl) {
            return false;
        }

        tokio::time::sleep(self.timing.stabilize).await;

        let won = self
            .current(id)
            .is_some_and(|r| r.owner_id == owner_id);
        debug!(subject = %id, owner = %owner_id, won, "lease acquisition settled");
        won
    }

    /// Push our expiry forward. Returns `false` (and writes nothing) if the
    /// lease is no longer ours.
    pub fn renew(&self, id: &SubjectId, owner_id: &str, ttl: Duration) -> bool {
        if !self.store.is_available() {
            return true;
        }
        match self.current(id) {
            Some(record) if record.owner_id == owner_id => {
                self.write(id, owner_id, self.clock.now_ms(), ttl)
            }
            _ => false,
        }
    }

    /// Delete the record, but only if it is still ours.
    pub fn release(&self, id: &SubjectId, owner_id: &str) {
        let ours = self
            .current(id)
            .is_some_and(|r| r.owner_id == owner_id);
        if !ours {
            return;
        }
        if let Err(e) = self.store.remove(&self.keys.lease_key(id)) {
            warn!(subject = %id, error = %e, "failed to release lease");
        } else {
            debug!(subject = %id, owner = %owner_id, "lease released");
        }
    }

    fn write(&self, id: &SubjectId, owner_id: &str, now: i64, ttl: Duration) -> bool {
        let record = LeaseRecord {
            subject_id: id.clone(),
            owner_id: owner_id.to_string(),
            expires_at: now.saturating_add(duration_ms(ttl)),
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(subject = %id, error = %e, "failed to encode lease");
                return false;
            }
        };
        match self.store.set(&self.keys.lease_key(id), &raw) {
            Ok(()) => true,
            Err(e) => {
                warn!(subject = %id, error = %e, "failed to write lease");
                false
            }
        }
    }
}

pub(crate) fn parse_record(raw: &str) -> Option<LeaseRecord> {
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(error = %e, "ignoring malformed lease record");
            None
        }
    }
}
