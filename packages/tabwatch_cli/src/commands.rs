use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tabwatch::clock::{Clock, SystemClock};
use tabwatch::credentials::{CachedTokenProvider, EnvToken, StaticToken, TokenProvider};
use tabwatch::lease::{AcquireTiming, LeaseManager};
use tabwatch::pending::PendingRegistry;
use tabwatch::snapshot::SnapshotCache;
use tabwatch::store::{FileStore, SharedStore};
use tabwatch::{
    Coordinator, HttpEndpoint, INBOX_SUBJECT, InboxClient, InboxEnvelope, InboxSource, KeyClass,
    Keyspace, PollOutcome, ProgressSnapshot, ProgressSource, SubjectId, SubjectSource, Tracking,
};

use crate::config::{FileConfig, TabwatchConfig};
use crate::sink::{InboxSink, TerminalSink};

fn open_store(config: &TabwatchConfig) -> Result<Arc<dyn SharedStore>> {
    let store = FileStore::open(&config.store_dir)
        .with_context(|| format!("Failed to open shared store at {:?}", config.store_dir))?;
    Ok(Arc::new(store))
}

fn token_provider(fc: &FileConfig) -> Arc<dyn TokenProvider> {
    match &fc.credentials.token_env {
        Some(var) => Arc::new(CachedTokenProvider::new(
            EnvToken::new(var.clone()),
            Duration::from_secs(fc.credentials.cache_ttl_secs),
            Arc::new(SystemClock),
        )),
        None => Arc::new(StaticToken::anonymous()),
    }
}

fn job_coordinator(
    store: Arc<dyn SharedStore>,
    fc: &FileConfig,
) -> Result<Coordinator<ProgressSource>> {
    let source = ProgressSource::new(&fc.server.base_url, &fc.server.progress_endpoint)
        .context("Invalid server.base_url")?;
    Ok(
        Coordinator::builder(store, source, Arc::new(TerminalSink))
            .tokens(token_provider(fc))
            .settings(fc.coordinator_settings())
            .build(),
    )
}

fn inbox_client(fc: &FileConfig) -> Result<InboxClient> {
    let http = HttpEndpoint::new(&fc.server.base_url).context("Invalid server.base_url")?;
    Ok(InboxClient::new(http, &fc.server.inbox_endpoint))
}

/// Run until every tracked subject is done, or until Ctrl-C.
async fn run_until_idle<S: SubjectSource>(coordinator: &Coordinator<S>) -> Result<()> {
    tokio::select! {
        _ = coordinator.wait_idle() => {
            info!(metrics = ?coordinator.metrics(), "nothing left to track");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received shutdown signal, handing subjects over...");
            coordinator.shutdown().await;
        }
    }
    Ok(())
}

pub async fn track_command(config: &TabwatchConfig, fc: &FileConfig, ids: Vec<String>) -> Result<()> {
    let coordinator = job_coordinator(open_store(config)?, fc)?;
    info!(owner = coordinator.owner_id(), "tracking {} job(s)", ids.len());
    for id in ids {
        if coordinator.track(id.as_str()) == Tracking::Detached {
            anyhow::bail!("shared store unavailable, cannot track {id}");
        }
    }
    run_until_idle(&coordinator).await
}

pub async fn resume_command(config: &TabwatchConfig, fc: &FileConfig) -> Result<()> {
    let coordinator = job_coordinator(open_store(config)?, fc)?;
    let resumed = coordinator.resume_from_registry();
    if resumed == 0 {
        println!("No pending jobs.");
        return Ok(());
    }
    println!("Resumed {resumed} job(s).");
    run_until_idle(&coordinator).await
}

pub async fn inbox_command(
    config: &TabwatchConfig,
    fc: &FileConfig,
    mark_read: bool,
    clear: bool,
) -> Result<()> {
    let client = inbox_client(fc)?;
    let tokens = token_provider(fc);

    if mark_read || clear {
        let token = tokens
            .ensure_token()
            .await
            .context("No bearer token available")?;
        let inbox = if clear {
            client.clear(&token).await.context("Failed to clear inbox")?
        } else {
            let unread: Vec<String> = fetch_inbox(&client, &token)
                .await?
                .notifications
                .into_iter()
                .filter(|n| !n.read)
                .map(|n| n.id)
                .collect();
            client
                .mark_read(&token, &unread)
                .await
                .context("Failed to mark notifications as read")?
        };
        println!("({} unread)", inbox.unread());
        return Ok(());
    }

    let source = InboxSource::new(client, fc.inbox_policy());
    let coordinator = Coordinator::builder(open_store(config)?, source, Arc::new(InboxSink::default()))
        .tokens(tokens)
        .settings(fc.coordinator_settings())
        .build();
    coordinator.track(INBOX_SUBJECT);
    run_until_idle(&coordinator).await
}

async fn fetch_inbox(client: &InboxClient, token: &str) -> Result<InboxEnvelope> {
    match client.fetch(token).await.context("Failed to fetch inbox")? {
        PollOutcome::Updated(inbox) => Ok(inbox),
        _ => Ok(InboxEnvelope::default()),
    }
}

pub fn forget_command(config: &TabwatchConfig, fc: &FileConfig, id: String) -> Result<()> {
    let store = open_store(config)?;
    let coordinator = job_coordinator(store.clone(), fc)?;
    coordinator.forget(id.as_str());

    let keys = Keyspace::new(&fc.coordinator_settings().key_prefix, coordinator.kind());
    SnapshotCache::<ProgressSnapshot>::new(store, keys)
        .remove(&SubjectId::from(id.as_str()))
        .context("Failed to drop cached snapshot")?;
    println!("Forgot {id}.");
    Ok(())
}

#[derive(Debug, Serialize)]
struct JobRow {
    id: SubjectId,
    pending_until: Option<DateTime<Utc>>,
    leader: Option<String>,
    lease_until: Option<DateTime<Utc>>,
    snapshot: Option<ProgressSnapshot>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    jobs: Vec<JobRow>,
    inbox: Option<InboxEnvelope>,
}

fn millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn collect_status(store: Arc<dyn SharedStore>, fc: &FileConfig) -> StatusReport {
    let settings = fc.coordinator_settings();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jobs = Keyspace::new(&settings.key_prefix, "task");
    let pending = PendingRegistry::new(
        store.clone(),
        jobs.pending_key(),
        clock.clone(),
        settings.pending_ttl,
    );
    let leases = LeaseManager::new(store.clone(), jobs.clone(), clock, AcquireTiming::default());
    let snapshots = SnapshotCache::<ProgressSnapshot>::new(store.clone(), jobs.clone());
    let inbox = SnapshotCache::<InboxEnvelope>::new(
        store.clone(),
        Keyspace::new(&settings.key_prefix, "notifications"),
    );

    let mut ids: Vec<(SubjectId, Option<i64>)> = pending
        .entries()
        .into_iter()
        .map(|entry| (entry.subject_id, Some(entry.expires_at)))
        .collect();
    // Snapshots outlive registry entries; list finished jobs too.
    let mut cached: Vec<SubjectId> = store
        .keys()
        .iter()
        .filter_map(|key| match jobs.classify(key) {
            Some(KeyClass::Snapshot(id)) => Some(id),
            _ => None,
        })
        .filter(|id| !ids.iter().any(|(pending, _)| pending == id))
        .collect();
    cached.sort();
    ids.extend(cached.into_iter().map(|id| (id, None)));

    let rows = ids
        .into_iter()
        .map(|(id, pending_until)| JobRow {
            pending_until: pending_until.and_then(millis),
            leader: leases.live_owner(&id),
            lease_until: leases.current(&id).and_then(|l| millis(l.expires_at)),
            snapshot: snapshots.read(&id),
            id,
        })
        .collect();

    StatusReport {
        jobs: rows,
        inbox: inbox.read(&SubjectId::from(INBOX_SUBJECT)),
    }
}

pub fn status_command(config: &TabwatchConfig, fc: &FileConfig, json: bool) -> Result<()> {
    let report = collect_status(open_store(config)?, fc);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.jobs.is_empty() {
        println!("No pending jobs.");
    }
    for job in &report.jobs {
        let leader = job.leader.as_deref().unwrap_or("-");
        let status = job
            .snapshot
            .as_ref()
            .map(|s| crate::sink::render_progress(&job.id, s))
            .unwrap_or_else(|| "(no snapshot yet)".to_string());
        println!("{:<24} {:<38} {}", job.id, leader, status);
    }
    if let Some(inbox) = &report.inbox {
        println!("inbox: {} unread of {}", inbox.unread(), inbox.notifications.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabwatch::store::MemoryHub;

    #[test]
    fn test_status_lists_pending_jobs_with_leaders() {
        let hub = MemoryHub::new();
        let store: Arc<dyn SharedStore> = Arc::new(hub.attach());
        let now = SystemClock.now_ms();
        store
            .set(
                "tabwatch:task:pending",
                &serde_json::json!([{"subjectId": "r-1", "expiresAt": now + 60_000}]).to_string(),
            )
            .unwrap();
        store
            .set(
                "tabwatch:task:lease:r-1",
                &serde_json::json!({"subjectId": "r-1", "ownerId": "tab-a", "expiresAt": now + 30_000})
                    .to_string(),
            )
            .unwrap();
        store
            .set(
                "tabwatch:notifications:snapshot:inbox",
                r#"{"notifications":[{"id":"n1","title":"Hi"}]}"#,
            )
            .unwrap();

        store
            .set(
                "tabwatch:task:snapshot:r-0",
                r#"{"status":"done","done":true,"progress":100}"#,
            )
            .unwrap();

        let report = collect_status(store, &FileConfig::default());
        assert_eq!(report.jobs.len(), 2);
        assert!(report.jobs[1].snapshot.as_ref().unwrap().done);
        assert!(report.jobs[1].pending_until.is_none());
        assert_eq!(report.jobs[0].id, SubjectId::from("r-1"));
        assert_eq!(report.jobs[0].leader.as_deref(), Some("tab-a"));
        assert!(report.jobs[0].snapshot.is_none());
        assert_eq!(report.inbox.unwrap().unread(), 1);
    }

    #[test]
    fn test_token_provider_defaults_to_anonymous() {
        let fc = FileConfig::default();
        let tokens = token_provider(&fc);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert_eq!(rt.block_on(tokens.ensure_token()), Some(String::new()));
    }
}
