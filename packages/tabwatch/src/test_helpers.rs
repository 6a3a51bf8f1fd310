use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::clock::{Clock, ManualClock, duration_ms};
use crate::coordinator::{Coordinator, CoordinatorSettings};
use crate::credentials::{StaticToken, TokenProvider};
use crate::error::SourceError;
use crate::lease::AcquireTiming;
use crate::progress::{Progress, ProgressSnapshot};
use crate::sink::{Completion, ProgressSink};
use crate::source::{Cadence, PollOutcome, SubjectSource};
use crate::store::MemoryHub;
use crate::subject::{Revision, SubjectId};

pub(crate) fn snapshot(id: &str, revision: &str, done: bool) -> ProgressSnapshot {
    ProgressSnapshot {
        subject_id: SubjectId::from(id),
        status: if done { "done" } else { "running" }.to_string(),
        title: Some(format!("Job {id}")),
        progress: if done {
            Progress::Percent(100)
        } else {
            Progress::Indeterminate
        },
        done,
        revision: Some(Revision::new(revision)),
        ..Default::default()
    }
}

/// Like [`snapshot`], stamped `secs` seconds into a fixed day.
pub(crate) fn snapshot_at(id: &str, revision: &str, done: bool, secs: u32) -> ProgressSnapshot {
    let mut snap = snapshot(id, revision, done);
    snap.updated_at = Utc
        .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .map(|t| t + chrono::Duration::seconds(i64::from(secs)));
    snap
}

type Scripted = Result<PollOutcome<ProgressSnapshot>, SourceError>;

struct ScriptInner {
    tx: mpsc::UnboundedSender<Scripted>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Scripted>>,
    calls: AtomicUsize,
    cursors: Mutex<Vec<Option<Revision>>>,
    started: Mutex<Vec<Instant>>,
}

/// A source whose every poll blocks until the test queues a response, the
/// way a long-poll request hangs until the server has something to say.
#[derive(Clone)]
pub(crate) struct ScriptedSource {
    inner: Arc<ScriptInner>,
    cadence: Cadence,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::with_cadence(Cadence::LongPoll)
    }

    pub(crate) fn with_cadence(cadence: Cadence) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ScriptInner {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                calls: AtomicUsize::new(0),
                cursors: Mutex::new(Vec::new()),
                started: Mutex::new(Vec::new()),
            }),
            cadence,
        }
    }

    pub(crate) fn respond(&self, outcome: Scripted) {
        let _ = self.inner.tx.send(outcome);
    }

    pub(crate) fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn cursors(&self) -> Vec<Option<Revision>> {
        self.inner.cursors.lock().unwrap().clone()
    }

    pub(crate) fn started(&self) -> Vec<Instant> {
        self.inner.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubjectSource for ScriptedSource {
    type Payload = ProgressSnapshot;

    fn kind(&self) -> &'static str {
        "task"
    }

    fn cadence(&self) -> Cadence {
        self.cadence
    }

    async fn poll(
        &self,
        _id: &SubjectId,
        cursor: Option<&Revision>,
        _token: &str,
    ) -> Scripted {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.cursors.lock().unwrap().push(cursor.cloned());
        self.inner.started.lock().unwrap().push(Instant::now());
        let mut rx = self.inner.rx.lock().await;
        match rx.recv().await {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    fn is_terminal(&self, payload: &ProgressSnapshot) -> bool {
        payload.done
    }

    fn revision(&self, payload: &ProgressSnapshot) -> Option<Revision> {
        payload.revision.clone()
    }

    fn has_news(&self, previous: Option<&ProgressSnapshot>, next: &ProgressSnapshot) -> bool {
        previous.is_none_or(|p| p.revision != next.revision)
    }

    fn is_newer(&self, current: &ProgressSnapshot, candidate: &ProgressSnapshot) -> bool {
        match (current.updated_at, candidate.updated_at) {
            (Some(shown), Some(incoming)) => incoming >= shown,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkEvent {
    Update(SubjectId, ProgressSnapshot),
    Finish(SubjectId, Completion),
    Refresh(SubjectId),
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn updates(&self) -> Vec<ProgressSnapshot> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Update(_, snap) => Some(snap),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn finishes(&self) -> Vec<Completion> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Finish(_, completion) => Some(completion),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn refreshes(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Refresh(_)))
            .count()
    }
}

impl ProgressSink<ProgressSnapshot> for RecordingSink {
    fn update(&self, id: &SubjectId, payload: &ProgressSnapshot) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Update(id.clone(), payload.clone()));
    }

    fn finish(&self, id: &SubjectId, completion: Completion) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Finish(id.clone(), completion));
    }

    fn refresh_downstream(&self, id: &SubjectId) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Refresh(id.clone()));
    }
}

pub(crate) fn test_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        lease_ttl: Duration::from_secs(30),
        acquire: AcquireTiming {
            jitter: Duration::from_millis(20),
            stabilize: Duration::from_millis(30),
        },
        promotion_interval: Duration::from_secs(1),
        pending_ttl: Duration::from_secs(600),
        credential_attempts: 3,
        credential_backoff: Duration::from_millis(100),
        ..Default::default()
    }
}

/// One simulated tab attached to `hub`.
pub(crate) struct Instance {
    pub(crate) coordinator: Coordinator<ScriptedSource>,
    pub(crate) source: ScriptedSource,
    pub(crate) sink: Arc<RecordingSink>,
}

pub(crate) fn instance(hub: &MemoryHub, clock: &ManualClock, owner: &str) -> Instance {
    instance_with(
        hub,
        clock,
        owner,
        ScriptedSource::new(),
        Arc::new(StaticToken::anonymous()),
    )
}

pub(crate) fn instance_with(
    hub: &MemoryHub,
    clock: &ManualClock,
    owner: &str,
    source: ScriptedSource,
    tokens: Arc<dyn TokenProvider>,
) -> Instance {
    let sink = Arc::new(RecordingSink::default());
    let coordinator = Coordinator::builder(Arc::new(hub.attach()), source.clone(), sink.clone())
        .clock(Arc::new(clock.clone()))
        .tokens(tokens)
        .settings(test_settings())
        .owner_id(owner)
        .build();
    Instance {
        coordinator,
        source,
        sink,
    }
}

/// Poll `check` until it holds, sleeping in small steps. Works with a
/// paused clock.
pub(crate) async fn eventually(what: &str, check: impl FnMut() -> bool) {
    eventually_within(what, Duration::from_secs(10), check).await;
}

/// [`eventually`] with an explicit budget, checked in 1000 steps.
pub(crate) async fn eventually_within(
    what: &str,
    budget: Duration,
    mut check: impl FnMut() -> bool,
) {
    let step = budget / 1000;
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(step).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wall clock driven by tokio time, so lease expiry follows a paused
/// runtime's auto-advance.
#[derive(Debug, Clone)]
pub(crate) struct TokioClock {
    origin: Instant,
    start_ms: i64,
}

impl TokioClock {
    pub(crate) fn new(start_ms: i64) -> Self {
        Self {
            origin: Instant::now(),
            start_ms,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.start_ms + duration_ms(self.origin.elapsed())
    }
}
