//! Notification inbox: one never-ending subject, synced on an interval that
//! backs off while nothing new arrives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::SourceError;
use crate::http::{HttpEndpoint, read_outcome};
use crate::source::{BackoffPolicy, Cadence, PollOutcome, SubjectSource};
use crate::subject::{Revision, SubjectId};

/// The inbox is tracked as a single subject with this id.
pub const INBOX_SUBJECT: &str = "inbox";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEnvelope {
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl InboxEnvelope {
    pub fn unread(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    /// Notifications whose id does not appear in `previous`.
    pub fn new_since<'a>(&'a self, previous: &InboxEnvelope) -> Vec<&'a Notification> {
        let seen: HashSet<&str> = previous
            .notifications
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        self.notifications
            .iter()
            .filter(|n| !seen.contains(n.id.as_str()))
            .collect()
    }
}

#[derive(Serialize)]
struct MarkRead<'a> {
    ids: &'a [String],
    read: bool,
}

/// `GET`/`PUT`/`DELETE {base}/{route}`
#[derive(Debug, Clone)]
pub struct InboxClient {
    http: HttpEndpoint,
    route: String,
}

impl InboxClient {
    pub fn new(http: HttpEndpoint, route: &str) -> Self {
        Self {
            http,
            route: route.to_string(),
        }
    }

    async fn send(
        &self,
        method: Method,
        token: &str,
        body: Option<&MarkRead<'_>>,
    ) -> Result<PollOutcome<InboxEnvelope>, SourceError> {
        let url = self.http.url(&self.route, &[]);
        let mut request = self.http.request(method, url, token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(SourceError::from_reqwest)?;
        read_outcome(response).await
    }

    pub async fn fetch(&self, token: &str) -> Result<PollOutcome<InboxEnvelope>, SourceError> {
        self.send(Method::GET, token, None).await
    }

    /// Mark notifications as read; returns the server's new inbox.
    pub async fn mark_read(&self, token: &str, ids: &[String]) -> Result<InboxEnvelope, SourceError> {
        let body = MarkRead { ids, read: true };
        expect_envelope(self.send(Method::PUT, token, Some(&body)).await?)
    }

    /// Remove every notification; returns the server's new inbox.
    pub async fn clear(&self, token: &str) -> Result<InboxEnvelope, SourceError> {
        expect_envelope(self.send(Method::DELETE, token, None).await?)
    }
}

fn expect_envelope(outcome: PollOutcome<InboxEnvelope>) -> Result<InboxEnvelope, SourceError> {
    match outcome {
        PollOutcome::Updated(envelope) => Ok(envelope),
        PollOutcome::NoChange => Ok(InboxEnvelope::default()),
        PollOutcome::NotFound => Err(SourceError::Status(404)),
    }
}

pub struct InboxSource {
    client: InboxClient,
    policy: BackoffPolicy,
}

impl InboxSource {
    pub fn new(client: InboxClient, policy: BackoffPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &InboxClient {
        &self.client
    }
}

#[async_trait]
impl SubjectSource for InboxSource {
    type Payload = InboxEnvelope;

    fn kind(&self) -> &'static str {
        "notifications"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Interval(self.policy)
    }

    async fn poll(
        &self,
        _id: &SubjectId,
        _cursor: Option<&Revision>,
        token: &str,
    ) -> Result<PollOutcome<InboxEnvelope>, SourceError> {
        self.client.fetch(token).await
    }

    fn is_terminal(&self, _payload: &InboxEnvelope) -> bool {
        false
    }

    fn revision(&self, payload: &InboxEnvelope) -> Option<Revision> {
        payload
            .updated_at
            .map(|at| Revision::new(at.to_rfc3339()))
    }

    fn has_news(&self, previous: Option<&InboxEnvelope>, next: &InboxEnvelope) -> bool {
        match previous {
            Some(previous) => !next.new_since(previous).is_empty(),
            None => !next.notifications.is_empty(),
        }
    }

    fn is_newer(&self, current: &InboxEnvelope, candidate: &InboxEnvelope) -> bool {
        match (current.updated_at, candidate.updated_at) {
            (Some(shown), Some(incoming)) => incoming >= shown,
            _ => true,
        }
    }
}
