//! Coordinator counters for observability.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    /// Requests sent to the subject endpoint
    pub polls_issued: AtomicU64,
    /// 204 responses
    pub heartbeats: AtomicU64,
    /// Responses carrying a fresh payload
    pub updates: AtomicU64,
    /// Subjects finished as success or vanished
    pub terminals: AtomicU64,
    /// Subjects given up after an error
    pub failures: AtomicU64,
    /// Times this instance lost a lease mid-flight
    pub demotions: AtomicU64,
    /// Times a follower took over a subject
    pub promotions: AtomicU64,
    /// Snapshots applied from another instance's writes
    pub mirrored: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn poll_issued(&self) {
        self.polls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn terminal(&self) {
        self.terminals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mirrored(&self) {
        self.mirrored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls_issued: self.polls_issued.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            terminals: self.terminals.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            mirrored: self.mirrored.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub polls_issued: u64,
    pub heartbeats: u64,
    pub updates: u64,
    pub terminals: u64,
    pub failures: u64,
    pub demotions: u64,
    pub promotions: u64,
    pub mirrored: u64,
}
