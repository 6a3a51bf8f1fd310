use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{SharedStore, StoreChange, StoreChanges, TaggedChange};
use crate::error::StoreError;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// On-disk value: who wrote it, and what.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: String,
    value: String,
}

/// A directory of files, one per key, shared by every process that opens it.
///
/// Writes go through a temp file and a rename so readers never see a torn
/// value. A file watcher turns foreign writes into [`StoreChange`]s; our own
/// writes are recognised by the origin stamped into each file, our own
/// removals by remembering them until the watcher reports them.
pub struct FileStore {
    dir: PathBuf,
    origin: String,
    tx: broadcast::Sender<TaggedChange>,
    removed_locally: Arc<Mutex<HashSet<String>>>,
    _watcher: RecommendedWatcher,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            key: dir.display().to_string(),
            source,
        })?;

        let origin = uuid::Uuid::new_v4().to_string();
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let removed_locally = Arc::new(Mutex::new(HashSet::new()));

        let forwarder = Forwarder {
            origin: origin.clone(),
            removed_locally: removed_locally.clone(),
            tx: tx.clone(),
        };
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => forwarder.forward(&event),
                Err(e) => warn!(error = %e, "store watcher error"),
            })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!(dir = %dir.display(), origin = %origin, "opened file store");

        Ok(Self {
            dir,
            origin,
            tx,
            removed_locally,
            _watcher: watcher,
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

impl SharedStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        read_envelope(&self.path_for(key)).map(|e| e.value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let envelope = Envelope {
            origin: self.origin.clone(),
            value: value.to_string(),
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;

        let name = encode_key(key);
        let tmp = self.dir.join(format!(".{name}.{}.tmp", self.origin));
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, self.dir.join(&name)).map_err(io_err)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.removed_locally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());

        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.removed_locally
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(key);
                if e.kind() == io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(StoreError::Io {
                        key: key.to_string(),
                        source: e,
                    })
                }
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to list store directory");
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .filter_map(|name| decode_key(&name))
            .collect()
    }

    fn changes(&self) -> StoreChanges {
        StoreChanges::new(self.tx.subscribe(), None)
    }
}

/// Runs on the watcher's thread.
struct Forwarder {
    origin: String,
    removed_locally: Arc<Mutex<HashSet<String>>>,
    tx: broadcast::Sender<TaggedChange>,
}

impl Forwarder {
    fn forward(&self, event: &Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }

        for path in &event.paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(key) = decode_key(name) else {
                continue;
            };

            let value = match read_envelope(path) {
                Some(envelope) if envelope.origin == self.origin => continue,
                Some(envelope) => Some(envelope.value),
                None => {
                    let ours = self
                        .removed_locally
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&key);
                    if ours {
                        continue;
                    }
                    None
                }
            };

            debug!(key = %key, removed = value.is_none(), "foreign store change");
            let _ = self.tx.send(TaggedChange {
                origin: 0,
                change: StoreChange { key, value },
            });
        }
    }
}

fn read_envelope(path: &Path) -> Option<Envelope> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read store file");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed store file");
            None
        }
    }
}

/// File name for a key: `[A-Za-z0-9_-]` verbatim, every other byte as `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
