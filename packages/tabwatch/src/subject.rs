use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a trackable unit of server-side work.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&SubjectId> for SubjectId {
    fn from(id: &SubjectId) -> Self {
        id.clone()
    }
}

/// Server-issued cursor. Only ever compared for equality, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(rev: impl Into<String>) -> Self {
        Self(rev.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a store key belongs to, as far as one subject kind is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyClass {
    Lease(SubjectId),
    Snapshot(SubjectId),
    Pending,
}

/// Store key layout for one subject kind:
///
/// ```text
/// <prefix>:<kind>:lease:<id>
/// <prefix>:<kind>:snapshot:<id>
/// <prefix>:<kind>:pending
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    root: String,
}

impl Keyspace {
    pub fn new(prefix: &str, kind: &str) -> Self {
        Self {
            root: format!("{prefix}:{kind}:"),
        }
    }

    pub fn lease_key(&self, id: &SubjectId) -> String {
        format!("{}lease:{}", self.root, id)
    }

    pub fn snapshot_key(&self, id: &SubjectId) -> String {
        format!("{}snapshot:{}", self.root, id)
    }

    pub fn pending_key(&self) -> String {
        format!("{}pending", self.root)
    }

    /// Classify a key, or `None` if it belongs to another kind or prefix.
    pub fn classify(&self, key: &str) -> Option<KeyClass> {
        let rest = key.strip_prefix(&self.root)?;
        if rest == "pending" {
            return Some(KeyClass::Pending);
        }
        if let Some(id) = rest.strip_prefix("lease:") {
            return Some(KeyClass::Lease(SubjectId::from(id)));
        }
        rest.strip_prefix("snapshot:")
            .map(|id| KeyClass::Snapshot(SubjectId::from(id)))
    }
}
