//! Job progress subjects: long-polled, finished when `done` is set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SourceError;
use crate::http::{HttpEndpoint, read_outcome};
use crate::source::{Cadence, PollOutcome, SubjectSource};
use crate::subject::{Revision, SubjectId};

/// Completion estimate: a percentage, `"indeterminate"`, or `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Progress {
    Percent(u8),
    Indeterminate,
    #[default]
    Unknown,
}

impl Serialize for Progress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Percent(p) => serializer.serialize_u8(*p),
            Self::Indeterminate => serializer.serialize_str("indeterminate"),
            Self::Unknown => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Progress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Label(String),
        }

        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(Self::Unknown),
            Some(Raw::Number(n)) if n.is_finite() => Ok(Self::Percent(n.clamp(0.0, 100.0).round() as u8)),
            Some(Raw::Number(_)) => Ok(Self::Unknown),
            Some(Raw::Label(label)) if label == "indeterminate" => Ok(Self::Indeterminate),
            Some(Raw::Label(other)) => Err(D::Error::custom(format!(
                "unknown progress value {other:?}"
            ))),
        }
    }
}

/// Full progress state of one job. Replaced as a whole on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Filled in by the client; the server body does not carry it.
    #[serde(default)]
    pub subject_id: SubjectId,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revision: Option<Revision>,
}

/// `GET {base}/{route}/{id}/progress?last={revision}`
#[derive(Debug, Clone)]
pub struct ProgressSource {
    http: HttpEndpoint,
    route: String,
}

impl ProgressSource {
    pub fn new(base_url: &str, route: &str) -> Result<Self, SourceError> {
        Ok(Self::with_endpoint(HttpEndpoint::new(base_url)?, route))
    }

    pub fn with_endpoint(http: HttpEndpoint, route: &str) -> Self {
        Self {
            http,
            route: route.to_string(),
        }
    }
}

#[async_trait]
impl SubjectSource for ProgressSource {
    type Payload = ProgressSnapshot;

    fn kind(&self) -> &'static str {
        "task"
    }

    fn cadence(&self) -> Cadence {
        Cadence::LongPoll
    }

    async fn poll(
        &self,
        id: &SubjectId,
        cursor: Option<&Revision>,
        token: &str,
    ) -> Result<PollOutcome<ProgressSnapshot>, SourceError> {
        let mut url = self.http.url(&self.route, &[id.as_str(), "progress"]);
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("last", cursor.as_str());
        }

        let response = self
            .http
            .request(Method::GET, url, token)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;

        Ok(match read_outcome::<ProgressSnapshot>(response).await? {
            PollOutcome::Updated(mut snapshot) => {
                snapshot.subject_id = id.clone();
                PollOutcome::Updated(snapshot)
            }
            other => other,
        })
    }

    fn is_terminal(&self, payload: &ProgressSnapshot) -> bool {
        payload.done
    }

    fn revision(&self, payload: &ProgressSnapshot) -> Option<Revision> {
        payload.revision.clone()
    }

    fn is_newer(&self, current: &ProgressSnapshot, candidate: &ProgressSnapshot) -> bool {
        match (current.updated_at, candidate.updated_at) {
            (Some(shown), Some(incoming)) => incoming >= shown,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_accepts_every_wire_shape() {
        let parse = |json: &str| serde_json::from_str::<Progress>(json);
        assert_eq!(parse("42").unwrap(), Progress::Percent(42));
        assert_eq!(parse("42.6").unwrap(), Progress::Percent(43));
        assert_eq!(parse("250").unwrap(), Progress::Percent(100));
        assert_eq!(parse("\"indeterminate\"").unwrap(), Progress::Indeterminate);
        assert_eq!(parse("null").unwrap(), Progress::Unknown);
        assert!(parse("\"almost\"").is_err());
    }

    #[test]
    fn progress_serializes_back_to_wire_shapes() {
        assert_eq!(serde_json::to_string(&Progress::Percent(7)).unwrap(), "7");
        assert_eq!(
            serde_json::to_string(&Progress::Indeterminate).unwrap(),
            "\"indeterminate\""
        );
        assert_eq!(serde_json::to_string(&Progress::Unknown).unwrap(), "null");
    }

    #[test]
    fn server_body_decodes_with_defaults() {
        let body = r#"{
            "status": "validating",
            "icon": "hourglass",
            "title": "Report #12",
            "message": "Checking links",
            "progress": "indeterminate",
            "done": false,
            "variant": "info",
            "updatedAt": "2026-10-18T12:00:00Z",
            "revision": "r1"
        }"#;
        let snapshot: ProgressSnapshot = serde_json::from_str(body).unwrap();
        assert_eq!(snapshot.subject_id, SubjectId::default());
        assert_eq!(snapshot.progress, Progress::Indeterminate);
        assert_eq!(snapshot.revision, Some(Revision::new("r1")));

        let minimal: ProgressSnapshot = serde_json::from_str(r#"{"done": true}"#).unwrap();
        assert!(minimal.done);
        assert_eq!(minimal.progress, Progress::Unknown);
    }

    #[test]
    fn older_snapshots_are_not_newer() {
        let source = ProgressSource::new("http://localhost", "api/tasks").unwrap();
        let at = |s: &str| ProgressSnapshot {
            updated_at: Some(s.parse().unwrap()),
            ..serde_json::from_str("{}").unwrap()
        };
        let early = at("2026-10-18T12:00:00Z");
        let late = at("2026-10-18T12:00:05Z");
        assert!(source.is_newer(&early, &late));
        assert!(!source.is_newer(&late, &early));
        assert!(source.is_newer(&late, &late));
    }
}
