use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

use super::{SharedStore, StoreChange, StoreChanges, TaggedChange};
use crate::error::StoreError;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

struct HubInner {
    entries: Mutex<HashMap<String, String>>,
    tx: broadcast::Sender<TaggedChange>,
    next_origin: AtomicU64,
}

/// In-process store that several [`MemoryStore`] attachments share.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                entries: Mutex::new(HashMap::new()),
                tx,
                next_origin: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new attachment with its own origin.
    pub fn attach(&self) -> MemoryStore {
        MemoryStore {
            hub: self.inner.clone(),
            origin: self.inner.next_origin.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Copy of everything stored, sorted by key.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// One attachment to a [`MemoryHub`].
pub struct MemoryStore {
    hub: Arc<HubInner>,
    origin: u64,
}

impl MemoryStore {
    fn publish(&self, key: &str, value: Option<String>) {
        // No receivers is fine.
        let _ = self.hub.tx.send(TaggedChange {
            origin: self.origin,
            change: StoreChange {
                key: key.to_string(),
                value,
            },
        });
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.hub
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let previous = self
            .hub
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        if previous.as_deref() != Some(value) {
            self.publish(key, Some(value.to_string()));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let previous = self
            .hub
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if previous.is_some() {
            self.publish(key, None);
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.hub
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn changes(&self) -> StoreChanges {
        StoreChanges::new(self.hub.tx.subscribe(), Some(self.origin))
    }
}
