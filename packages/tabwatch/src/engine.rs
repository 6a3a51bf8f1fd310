//! Leader role: the poll loop.
//!
//! ```text
//! Polling ──204──▶ Heartbeat ──▶ Polling
//!    │ ──2xx──▶ Updated ──▶ Polling, or Terminal when done
//!    │ ──404──▶ Terminal (vanished)
//!    │ ──err──▶ Failed
//!    └ lease taken by another instance ──▶ Demoted
//! ```

use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Shared;
use crate::error::PollFailure;
use crate::follower::View;
use crate::lease::parse_record;
use crate::sink::Completion;
use crate::source::{Backoff, Cadence, PollOutcome, SubjectSource};
use crate::store::{Observed, StoreChanges};
use crate::subject::{Revision, SubjectId};

const MAX_CREDENTIAL_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) enum LeaderExit {
    /// Terminal payload or 404. Lease released, registry updated.
    Finished,
    /// Gave up. Lease released, registry updated.
    Failed(PollFailure),
    /// Another instance holds the lease now. Nothing was released.
    Demoted,
    Forgotten,
}

pub(crate) async fn lead<S: SubjectSource>(
    shared: &Shared<S>,
    id: &SubjectId,
    cancel: &CancellationToken,
    view: &mut View<S::Payload>,
) -> LeaderExit {
    let owner = shared.owner_id.as_str();
    let ttl = shared.settings.lease_ttl;
    let lease_key = shared.keys.lease_key(id);
    let mut changes = shared.store.changes();
    let mut backoff = match shared.source.cadence() {
        Cadence::LongPoll => None,
        Cadence::Interval(policy) => Some(Backoff::new(policy)),
    };
    let mut cursor: Option<Revision> = None;
    let mut last: Option<S::Payload> = None;

    info!(subject = %id, owner, "leading");

    loop {
        if !shared.leases.is_held_by(id, owner) {
            info!(subject = %id, "lease lost between polls");
            return LeaderExit::Demoted;
        }

        let token = match bearer_token(shared, id, cancel).await {
            Ok(token) => token,
            Err(exit) => return exit,
        };

        shared.metrics.poll_issued();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LeaderExit::Forgotten,
            _ = lease_taken(shared, id, &mut changes, &lease_key) => {
                info!(subject = %id, "lease taken over, aborting in-flight poll");
                return LeaderExit::Demoted;
            }
            result = shared.source.poll(id, cursor.as_ref(), &token) => result,
        };

        let had_news = match result {
            Ok(PollOutcome::NoChange) => {
                debug!(subject = %id, "heartbeat");
                shared.metrics.heartbeat();
                shared.pending.refresh_ttl(id);
                shared.leases.renew(id, owner, ttl);
                false
            }
            Ok(PollOutcome::NotFound) => {
                info!(subject = %id, "subject no longer exists");
                conclude(shared, id, Completion::Vanished);
                return LeaderExit::Finished;
            }
            Ok(PollOutcome::Updated(payload)) => {
                shared.metrics.update();
                if let Err(e) = shared.snapshots.write(id, &payload) {
                    warn!(subject = %id, error = %e, "failed to publish snapshot");
                }
                let news = shared.source.has_news(last.as_ref(), &payload);
                if let Some(revision) = shared.source.revision(&payload) {
                    debug!(subject = %id, revision = %revision, "update");
                    cursor = Some(revision);
                }
                shared.leases.renew(id, owner, ttl);
                shared.pending.refresh_ttl(id);
                view.show(&shared.source, shared.sink.as_ref(), id, &payload);

                if shared.source.is_terminal(&payload) {
                    info!(subject = %id, "subject finished");
                    conclude(shared, id, Completion::Success);
                    return LeaderExit::Finished;
                }
                last = Some(payload);
                news
            }
            Err(e) => {
                warn!(subject = %id, error = %e, "poll failed, giving up on subject");
                let failure = PollFailure::from(e);
                give_up(shared, id, &failure);
                return LeaderExit::Failed(failure);
            }
        };

        if let Some(backoff) = backoff.as_mut() {
            let delay = backoff.next_delay(had_news);
            debug!(subject = %id, ?delay, "next sync scheduled");
            if let Err(exit) =
                wait_holding_lease(shared, id, cancel, &mut changes, &lease_key, delay).await
            {
                return exit;
            }
        }
    }
}

/// Sleep for `delay` between interval syncs, renewing the lease often
/// enough that it cannot lapse while we wait.
async fn wait_holding_lease<S: SubjectSource>(
    shared: &Shared<S>,
    id: &SubjectId,
    cancel: &CancellationToken,
    changes: &mut StoreChanges,
    lease_key: &str,
    delay: Duration,
) -> Result<(), LeaderExit> {
    let owner = shared.owner_id.as_str();
    let ttl = shared.settings.lease_ttl;
    let period = (ttl / 3).max(Duration::from_millis(1));
    let wake = tokio::time::sleep(delay);
    tokio::pin!(wake);
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeaderExit::Forgotten),
            _ = lease_taken(shared, id, changes, lease_key) => return Err(LeaderExit::Demoted),
            _ = &mut wake => return Ok(()),
            _ = keepalive.tick() => {
                if !shared.leases.renew(id, owner, ttl) {
                    info!(subject = %id, "lease lost while waiting for next sync");
                    return Err(LeaderExit::Demoted);
                }
                shared.pending.refresh_ttl(id);
            }
        }
    }
}

/// Resolves once another instance has written itself into our lease.
async fn lease_taken<S: SubjectSource>(
    shared: &Shared<S>,
    id: &SubjectId,
    changes: &mut StoreChanges,
    lease_key: &str,
) {
    let owner = shared.owner_id.as_str();
    loop {
        match changes.recv().await {
            Some(Observed::Changed(change)) if change.key == lease_key => {
                let taken = change
                    .value
                    .as_deref()
                    .and_then(parse_record)
                    .is_some_and(|record| record.owner_id != owner);
                if taken {
                    return;
                }
            }
            Some(Observed::Missed(_)) => {
                if !shared.leases.is_held_by(id, owner) {
                    return;
                }
            }
            Some(Observed::Changed(_)) => {}
            None => std::future::pending::<()>().await,
        }
    }
}

/// Ask for a token, backing off while none is available. Keeps the lease
/// alive meanwhile.
async fn bearer_token<S: SubjectSource>(
    shared: &Shared<S>,
    id: &SubjectId,
    cancel: &CancellationToken,
) -> Result<String, LeaderExit> {
    let attempts = shared.settings.credential_attempts.max(1);
    let mut delay = shared.settings.credential_backoff;

    for attempt in 1..=attempts {
        if let Some(token) = shared.tokens.ensure_token().await {
            return Ok(token);
        }
        if attempt == attempts {
            break;
        }
        warn!(subject = %id, attempt, retry_in = ?delay, "no bearer token available");
        shared
            .leases
            .renew(id, &shared.owner_id, shared.settings.lease_ttl);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeaderExit::Forgotten),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = delay.saturating_mul(2).min(MAX_CREDENTIAL_BACKOFF);
    }

    let failure = PollFailure::Credentials { attempts };
    warn!(subject = %id, error = %failure, "giving up on subject");
    give_up(shared, id, &failure);
    Err(LeaderExit::Failed(failure))
}

fn conclude<S: SubjectSource>(shared: &Shared<S>, id: &SubjectId, completion: Completion) {
    shared.pending.remove(id);
    shared.leases.release(id, &shared.owner_id);
    shared.sink.finish(id, completion);
    shared.sink.refresh_downstream(id);
    shared.metrics.terminal();
}

fn give_up<S: SubjectSource>(shared: &Shared<S>, id: &SubjectId, failure: &PollFailure) {
    shared.pending.remove(id);
    shared.leases.release(id, &shared.owner_id);
    shared.sink.finish(
        id,
        Completion::Interrupted {
            reason: failure.to_string(),
        },
    );
    shared.metrics.failure();
}
