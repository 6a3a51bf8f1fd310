//! Shared key/value store adapters.
//!
//! Every backend offers synchronous `get`/`set`/`remove` plus a change feed
//! that only reports writes made by *other* attachments, the same contract
//! as a browser's local storage and its `storage` event.

mod file;
mod memory;
mod null;

pub use file::FileStore;
pub use memory::{MemoryHub, MemoryStore};
pub use null::NullStore;

use tokio::sync::broadcast;

use crate::error::StoreError;

/// A key written or removed by another attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    /// New value, or `None` when the key was removed.
    pub value: Option<String>,
}

/// What a [`StoreChanges`] subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Changed(StoreChange),
    /// The subscriber fell behind and this many changes were dropped.
    /// Consumers should re-read whatever state they care about.
    Missed(u64),
}

#[derive(Debug, Clone)]
pub(crate) struct TaggedChange {
    pub(crate) origin: u64,
    pub(crate) change: StoreChange,
}

/// Subscription to foreign writes.
pub struct StoreChanges {
    rx: Option<broadcast::Receiver<TaggedChange>>,
    local_origin: Option<u64>,
}

impl StoreChanges {
    pub(crate) fn new(rx: broadcast::Receiver<TaggedChange>, local_origin: Option<u64>) -> Self {
        Self {
            rx: Some(rx),
            local_origin,
        }
    }

    /// A subscription that never yields anything.
    pub fn closed() -> Self {
        Self {
            rx: None,
            local_origin: None,
        }
    }

    /// Next foreign change. `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<Observed> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(tagged) if Some(tagged.origin) == self.local_origin => continue,
                Ok(tagged) => return Some(Observed::Changed(tagged.change)),
                Err(broadcast::error::RecvError::Lagged(n)) => return Some(Observed::Missed(n)),
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

/// Synchronous key/value store shared by every instance of one origin.
pub trait SharedStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Every key currently stored.
    fn keys(&self) -> Vec<String>;

    /// Subscribe to writes made by other attachments.
    fn changes(&self) -> StoreChanges;

    /// `false` for stores that cannot persist or broadcast anything.
    fn is_available(&self) -> bool {
        true
    }
}
