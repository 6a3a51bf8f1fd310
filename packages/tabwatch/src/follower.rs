//! Follower role: mirror what the leader writes, take over when it is gone.

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Shared;
use crate::sink::{Completion, ProgressSink};
use crate::source::SubjectSource;
use crate::store::Observed;
use crate::subject::{KeyClass, SubjectId};

pub(crate) enum FollowerExit {
    /// A terminal snapshot was mirrored.
    Finished,
    /// This instance now holds the lease.
    Promoted,
    Forgotten,
}

/// What this instance currently shows for one subject.
pub(crate) struct View<P> {
    shown: Option<P>,
}

impl<P: Clone + Send + Sync + 'static> View<P> {
    pub(crate) fn new() -> Self {
        Self { shown: None }
    }

    /// Push `payload` to the sink unless it repeats or predates what is
    /// already on screen. Returns whether the sink was updated.
    pub(crate) fn show<S>(
        &mut self,
        source: &S,
        sink: &dyn ProgressSink<P>,
        id: &SubjectId,
        payload: &P,
    ) -> bool
    where
        S: SubjectSource<Payload = P>,
    {
        if let Some(current) = &self.shown {
            let revision = source.revision(payload);
            if revision.is_some() && revision == source.revision(current) {
                return false;
            }
            if !source.is_newer(current, payload) {
                debug!(subject = %id, "dropping out-of-order snapshot");
                return false;
            }
        }
        sink.update(id, payload);
        self.shown = Some(payload.clone());
        true
    }
}

/// Apply a snapshot written by some leader. Returns `true` if it was
/// terminal and the subject is now finished locally.
pub(crate) fn mirror<S: SubjectSource>(
    shared: &Shared<S>,
    id: &SubjectId,
    view: &mut View<S::Payload>,
    payload: &S::Payload,
) -> bool {
    view.show(&shared.source, shared.sink.as_ref(), id, payload);
    if !shared.source.is_terminal(payload) {
        return false;
    }

    info!(subject = %id, "terminal snapshot mirrored");
    shared.pending.remove(id);
    shared.sink.finish(id, Completion::Success);
    shared.sink.refresh_downstream(id);
    shared.metrics.terminal();
    true
}

pub(crate) async fn follow<S: SubjectSource>(
    shared: &Shared<S>,
    id: &SubjectId,
    cancel: &CancellationToken,
    view: &mut View<S::Payload>,
) -> FollowerExit {
    // Subscribe before reading so nothing written in between is lost.
    let mut changes = shared.store.changes();
    if let Some(payload) = shared.snapshots.read(id) {
        if mirror(shared, id, view, &payload) {
            return FollowerExit::Finished;
        }
    }

    let every = shared.settings.promotion_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(subject = %id, leader = ?shared.leases.live_owner(id), "following");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return FollowerExit::Forgotten,
            Some(observed) = changes.recv() => match observed {
                Observed::Changed(change) => match shared.keys.classify(&change.key) {
                    Some(KeyClass::Snapshot(subject)) if subject == *id => {
                        let Some(payload) = change
                            .value
                            .as_deref()
                            .and_then(|raw| shared.snapshots.decode(raw))
                        else {
                            continue;
                        };
                        shared.metrics.mirrored();
                        if mirror(shared, id, view, &payload) {
                            return FollowerExit::Finished;
                        }
                    }
                    Some(KeyClass::Lease(subject)) if subject == *id && change.value.is_none() => {
                        debug!(subject = %id, "lease released, contending");
                        if promote(shared, id, cancel).await {
                            return FollowerExit::Promoted;
                        }
                    }
                    _ => {}
                },
                Observed::Missed(n) => {
                    warn!(subject = %id, missed = n, "store change feed lagged, re-reading snapshot");
                    if let Some(payload) = shared.snapshots.read(id) {
                        if mirror(shared, id, view, &payload) {
                            return FollowerExit::Finished;
                        }
                    }
                }
            },
            _ = ticker.tick() => {
                if promote(shared, id, cancel).await {
                    return FollowerExit::Promoted;
                }
            }
        }
    }
}

/// Try to take the lease if nobody holds a live one.
async fn promote<S: SubjectSource>(
    shared: &Shared<S>,
    id: &SubjectId,
    cancel: &CancellationToken,
) -> bool {
    if shared.leases.live_owner(id).is_some() {
        return false;
    }

    shared.pending.refresh_ttl(id);
    let owner = shared.owner_id.as_str();
    if !shared
        .leases
        .acquire(id, owner, shared.settings.lease_ttl)
        .await
    {
        return false;
    }
    if cancel.is_cancelled() {
        shared.leases.release(id, owner);
        return false;
    }

    // A leader that gave up removes the subject; we are resuming it.
    shared.pending.add(id);
    shared.metrics.promotion();
    info!(subject = %id, owner, "promoted to leader");
    true
}
