//! Last-known payload per subject, written by the leader, read by followers.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

use crate::error::StoreError;
use crate::store::SharedStore;
use crate::subject::{Keyspace, SubjectId};

pub struct SnapshotCache<P> {
    store: Arc<dyn SharedStore>,
    keys: Keyspace,
    _payload: PhantomData<fn() -> P>,
}

impl<P> SnapshotCache<P>
where
    P: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn SharedStore>, keys: Keyspace) -> Self {
        Self {
            store,
            keys,
            _payload: PhantomData,
        }
    }

    /// Replace the stored snapshot. Other attachments see the write as a
    /// change on the subject's snapshot key.
    pub fn write(&self, id: &SubjectId, payload: &P) -> Result<(), StoreError> {
        let key = self.keys.snapshot_key(id);
        let raw = serde_json::to_string(payload).map_err(|source| StoreError::Encode {
            key: key.clone(),
            source,
        })?;
        self.store.set(&key, &raw)
    }

    pub fn read(&self, id: &SubjectId) -> Option<P> {
        let raw = self.store.get(&self.keys.snapshot_key(id))?;
        self.decode(&raw)
    }

    /// Decode a raw value, e.g. one carried by a store change.
    pub fn decode(&self, raw: &str) -> Option<P> {
        match serde_json::from_str(raw) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(error = %e, "ignoring malformed snapshot");
                None
            }
        }
    }

    pub fn remove(&self, id: &SubjectId) -> Result<(), StoreError> {
        self.store.remove(&self.keys.snapshot_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{Progress, ProgressSnapshot};
    use crate::store::MemoryHub;
    use crate::test_helpers::snapshot;

    #[test]
    fn written_snapshot_is_readable_by_siblings() {
        let hub = MemoryHub::new();
        let keys = Keyspace::new("tabwatch", "task");
        let leader = SnapshotCache::<ProgressSnapshot>::new(Arc::new(hub.attach()), keys.clone());
        let follower = SnapshotCache::<ProgressSnapshot>::new(Arc::new(hub.attach()), keys);
        let id = SubjectId::from("t1");

        let mut snap = snapshot("t1", "r1", false);
        snap.progress = Progress::Percent(40);
        leader.write(&id, &snap).unwrap();

        assert_eq!(follower.read(&id), Some(snap));
        assert!(hub.dump().contains_key("tabwatch:task:snapshot:t1"));

        follower.remove(&id).unwrap();
        assert_eq!(leader.read(&id), None);
    }

    #[test]
    fn garbage_reads_as_missing() {
        let hub = MemoryHub::new();
        let store = Arc::new(hub.attach());
        store.set("tabwatch:task:snapshot:t1", "[1,2").unwrap();
        let cache =
            SnapshotCache::<ProgressSnapshot>::new(store, Keyspace::new("tabwatch", "task"));
        assert_eq!(cache.read(&"t1".into()), None);
    }
}
