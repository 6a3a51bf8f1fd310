use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::credentials::{StaticToken, TokenProvider};
use crate::engine::{self, LeaderExit};
use crate::follower::{self, FollowerExit, View};
use crate::lease::{AcquireTiming, LeaseManager};
use crate::metrics::{CoordinatorMetrics, MetricsSnapshot};
use crate::pending::PendingRegistry;
use crate::sink::ProgressSink;
use crate::snapshot::SnapshotCache;
use crate::source::SubjectSource;
use crate::store::SharedStore;
use crate::subject::{Keyspace, SubjectId};

/// Tunables shared by every subject of one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// First segment of every store key.
    pub key_prefix: String,
    /// Must outlast the server's long-poll hold time, since the lease is
    /// only renewed between requests.
    pub lease_ttl: Duration,
    pub acquire: AcquireTiming,
    /// How often a follower checks whether the leader's lease lapsed.
    pub promotion_interval: Duration,
    pub pending_ttl: Duration,
    pub credential_attempts: u32,
    pub credential_backoff: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            key_prefix: "tabwatch".to_string(),
            lease_ttl: Duration::from_secs(45),
            acquire: AcquireTiming::default(),
            promotion_interval: Duration::from_secs(5),
            pending_ttl: Duration::from_secs(10 * 60),
            credential_attempts: 5,
            credential_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracking {
    Started,
    AlreadyTracked,
    /// No shared store; nothing is coordinated or persisted.
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Contending,
    Leader,
    Follower,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectStatus {
    pub id: SubjectId,
    pub role: Role,
}

struct Slot {
    cancel: CancellationToken,
    role: Role,
    epoch: u64,
}

/// State every per-subject task reads from.
pub(crate) struct Shared<S: SubjectSource> {
    pub(crate) store: Arc<dyn SharedStore>,
    pub(crate) keys: Keyspace,
    pub(crate) leases: LeaseManager,
    pub(crate) pending: PendingRegistry,
    pub(crate) snapshots: SnapshotCache<S::Payload>,
    pub(crate) source: S,
    pub(crate) sink: Arc<dyn ProgressSink<S::Payload>>,
    pub(crate) tokens: Arc<dyn TokenProvider>,
    pub(crate) settings: CoordinatorSettings,
    pub(crate) metrics: CoordinatorMetrics,
    pub(crate) owner_id: String,
    slots: Mutex<HashMap<SubjectId, Slot>>,
    next_epoch: AtomicU64,
    idle: Notify,
}

impl<S: SubjectSource> Shared<S> {
    fn slots(&self) -> MutexGuard<'_, HashMap<SubjectId, Slot>> {
        // A panicking subject task must not wedge the others.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_role(&self, id: &SubjectId, epoch: u64, role: Role) {
        if let Some(slot) = self.slots().get_mut(id).filter(|s| s.epoch == epoch) {
            slot.role = role;
        }
    }

    fn release_slot(&self, id: &SubjectId, epoch: u64) {
        let mut slots = self.slots();
        if slots.get(id).is_some_and(|s| s.epoch == epoch) {
            slots.remove(id);
        }
        if slots.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Tracks subjects of one kind across every instance attached to the same
/// shared store.
pub struct Coordinator<S: SubjectSource> {
    shared: Arc<Shared<S>>,
}

pub struct CoordinatorBuilder<S: SubjectSource> {
    store: Arc<dyn SharedStore>,
    source: S,
    sink: Arc<dyn ProgressSink<S::Payload>>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenProvider>,
    settings: CoordinatorSettings,
    owner_id: Option<String>,
}

impl<S: SubjectSource> CoordinatorBuilder<S> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Fixed instance id. Defaults to a random UUID.
    pub fn owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn build(self) -> Coordinator<S> {
        let keys = Keyspace::new(&self.settings.key_prefix, self.source.kind());
        let leases = LeaseManager::new(
            self.store.clone(),
            keys.clone(),
            self.clock.clone(),
            self.settings.acquire,
        );
        let pending = PendingRegistry::new(
            self.store.clone(),
            keys.pending_key(),
            self.clock.clone(),
            self.settings.pending_ttl,
        );
        let snapshots = SnapshotCache::new(self.store.clone(), keys.clone());
        let owner_id = self
            .owner_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Coordinator {
            shared: Arc::new(Shared {
                store: self.store,
                keys,
                leases,
                pending,
                snapshots,
                source: self.source,
                sink: self.sink,
                tokens: self.tokens,
                settings: self.settings,
                metrics: CoordinatorMetrics::new(),
                owner_id,
                slots: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        }
    }
}

impl<S: SubjectSource> Coordinator<S> {
    pub fn builder(
        store: Arc<dyn SharedStore>,
        source: S,
        sink: Arc<dyn ProgressSink<S::Payload>>,
    ) -> CoordinatorBuilder<S> {
        CoordinatorBuilder {
            store,
            source,
            sink,
            clock: Arc::new(SystemClock),
            tokens: Arc::new(StaticToken::anonymous()),
            settings: CoordinatorSettings::default(),
            owner_id: None,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.shared.owner_id
    }

    pub fn kind(&self) -> &'static str {
        self.shared.source.kind()
    }

    /// Start tracking `id`: register it as pending and spawn its task,
    /// which mirrors any cached snapshot and then contends for the lease.
    pub fn track(&self, id: impl Into<SubjectId>) -> Tracking {
        let id = id.into();
        if !self.shared.store.is_available() {
            warn!(subject = %id, "shared store unavailable, not tracking");
            return Tracking::Detached;
        }

        let cancel = CancellationToken::new();
        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::Relaxed);
        let fresh = {
            let mut slots = self.shared.slots();
            if slots.contains_key(&id) {
                false
            } else {
                slots.insert(
                    id.clone(),
                    Slot {
                        cancel: cancel.clone(),
                        role: Role::Contending,
                        epoch,
                    },
                );
                true
            }
        };

        self.shared.pending.add(&id);
        if !fresh {
            return Tracking::AlreadyTracked;
        }
        let span = info_span!("subject", kind = self.kind(), subject = %id);
        tokio::spawn(drive(self.shared.clone(), id, cancel, epoch).instrument(span));
        Tracking::Started
    }

    /// Stop tracking `id` on this instance and drop it from the registry.
    /// Returns whether it was tracked here.
    pub fn forget(&self, id: impl Into<SubjectId>) -> bool {
        let id = id.into();
        let slot = self.shared.slots().remove(&id);
        if let Some(slot) = &slot {
            slot.cancel.cancel();
        }
        self.shared.pending.remove(&id);
        self.shared.leases.release(&id, &self.shared.owner_id);
        if self.shared.slots().is_empty() {
            self.shared.idle.notify_waiters();
        }
        info!(subject = %id, was_tracked = slot.is_some(), "forgot subject");
        slot.is_some()
    }

    /// Track every live entry of the pending registry, e.g. after a reload.
    /// Returns how many subjects were newly started.
    pub fn resume_from_registry(&self) -> usize {
        if !self.shared.store.is_available() {
            return 0;
        }
        let ids = self.shared.pending.list();
        let started = ids
            .into_iter()
            .filter(|id| self.track(id) == Tracking::Started)
            .count();
        info!(kind = self.kind(), started, "resumed from pending registry");
        started
    }

    /// Subjects tracked by this instance, ordered by id.
    pub fn status(&self) -> Vec<SubjectStatus> {
        let mut status: Vec<_> = self
            .shared
            .slots()
            .iter()
            .map(|(id, slot)| SubjectStatus {
                id: id.clone(),
                role: slot.role,
            })
            .collect();
        status.sort_by(|a, b| a.id.cmp(&b.id));
        status
    }

    /// Subjects in the shared registry, tracked here or not.
    pub fn pending(&self) -> Vec<SubjectId> {
        self.shared.pending.list()
    }

    /// Last payload any leader published for `id`.
    pub fn snapshot(&self, id: impl Into<SubjectId>) -> Option<S::Payload> {
        self.shared.snapshots.read(&id.into())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Resolves once no subject is tracked by this instance.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.slots().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop every subject task, releasing held leases but keeping the
    /// registry so another instance (or a restart) picks the work up.
    pub async fn shutdown(&self) {
        for slot in self.shared.slots().values() {
            slot.cancel.cancel();
        }
        self.wait_idle().await;
        info!(kind = self.kind(), "coordinator stopped");
    }
}

impl<S: SubjectSource> Drop for Coordinator<S> {
    fn drop(&mut self) {
        for slot in self.shared.slots().values() {
            slot.cancel.cancel();
        }
    }
}

enum Phase {
    Lead,
    Follow,
}

async fn drive<S: SubjectSource>(
    shared: Arc<Shared<S>>,
    id: SubjectId,
    cancel: CancellationToken,
    epoch: u64,
) {
    let mut view = View::new();
    let finished = match shared.snapshots.read(&id) {
        Some(cached) => follower::mirror(&shared, &id, &mut view, &cached),
        None => false,
    };

    if !finished && !cancel.is_cancelled() {
        let won = shared
            .leases
            .acquire(&id, &shared.owner_id, shared.settings.lease_ttl)
            .await;
        let mut phase = if won { Phase::Lead } else { Phase::Follow };

        loop {
            if cancel.is_cancelled() {
                shared.leases.release(&id, &shared.owner_id);
                break;
            }
            phase = match phase {
                Phase::Lead => {
                    shared.set_role(&id, epoch, Role::Leader);
                    match engine::lead(&shared, &id, &cancel, &mut view).await {
                        LeaderExit::Demoted => {
                            shared.metrics.demotion();
                            Phase::Follow
                        }
                        LeaderExit::Forgotten => {
                            shared.leases.release(&id, &shared.owner_id);
                            break;
                        }
                        LeaderExit::Finished => break,
                        LeaderExit::Failed(failure) => {
                            debug!(error = %failure, "leader gave up");
                            break;
                        }
                    }
                }
                Phase::Follow => {
                    shared.set_role(&id, epoch, Role::Follower);
                    match follower::follow(&shared, &id, &cancel, &mut view).await {
                        FollowerExit::Promoted => Phase::Lead,
                        FollowerExit::Finished | FollowerExit::Forgotten => break,
                    }
                }
            };
        }
    }

    shared.release_slot(&id, epoch);
    debug!("subject task exited");
}
