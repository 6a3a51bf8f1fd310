//! The seam between the generic coordination machinery and a concrete kind
//! of subject (job progress, notification inbox, ...).

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::SourceError;
use crate::subject::{Revision, SubjectId};

/// Result of one successful round trip to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<P> {
    /// Nothing newer than the cursor (HTTP 204).
    NoChange,
    /// The subject no longer exists (HTTP 404).
    NotFound,
    /// Fresh full state.
    Updated(P),
}

/// How a leader paces its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Re-issue immediately; the server holds each request open.
    LongPoll,
    /// Sleep between requests, backing off while nothing changes.
    Interval(BackoffPolicy),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the random delay added to every interval.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(15),
            max: Duration::from_secs(300),
            jitter: Duration::from_secs(3),
        }
    }
}

/// Interval state: doubles on quiet syncs, snaps back to `base` on news.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.base,
        }
    }

    /// Interval before the next sync, jitter included.
    pub fn next_delay(&mut self, had_news: bool) -> Duration {
        self.current = if had_news {
            self.policy.base
        } else {
            self.current.saturating_mul(2).min(self.policy.max)
        };
        self.current + self.jitter()
    }

    /// Interval without jitter.
    pub fn current(&self) -> Duration {
        self.current
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.policy.jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

/// One kind of trackable subject.
#[async_trait]
pub trait SubjectSource: Send + Sync + 'static {
    type Payload: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Short name used to namespace store keys, e.g. `"task"`.
    fn kind(&self) -> &'static str;

    fn cadence(&self) -> Cadence;

    /// One request. `cursor` is the last revision this leader has seen, or
    /// `None` to ask for the full current state.
    async fn poll(
        &self,
        id: &SubjectId,
        cursor: Option<&Revision>,
        token: &str,
    ) -> Result<PollOutcome<Self::Payload>, SourceError>;

    /// `true` once the subject needs no further tracking.
    fn is_terminal(&self, payload: &Self::Payload) -> bool;

    fn revision(&self, payload: &Self::Payload) -> Option<Revision>;

    /// Whether `next` carries something new compared to `previous`. Drives
    /// the interval backoff reset.
    fn has_news(&self, previous: Option<&Self::Payload>, next: &Self::Payload) -> bool {
        let _ = (previous, next);
        true
    }

    /// Whether `candidate` may replace `current` on screen. Out-of-order
    /// snapshots are dropped rather than shown.
    fn is_newer(&self, current: &Self::Payload, candidate: &Self::Payload) -> bool {
        let _ = (current, candidate);
        true
    }
}
