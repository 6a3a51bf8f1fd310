use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::error::SourceError;
use crate::source::PollOutcome;

/// A base URL plus the HTTP client used to reach it.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: reqwest::Client,
    base: Url,
}

impl HttpEndpoint {
    pub fn new(base_url: &str) -> Result<Self, SourceError> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, SourceError> {
        let base = Url::parse(base_url)
            .map_err(|e| SourceError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SourceError::InvalidUrl(format!(
                "{base_url}: cannot carry a path"
            )));
        }
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `base/route/tail...`. `route` may contain slashes; every `tail` item
    /// becomes exactly one (percent-encoded) path segment.
    pub(crate) fn url(&self, route: &str, tail: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(route.split('/').filter(|s| !s.is_empty()));
            segments.extend(tail);
        }
        url
    }

    /// Request with bearer auth. An empty token sends no Authorization header.
    pub(crate) fn request(&self, method: Method, url: Url, token: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        if token.is_empty() {
            builder
        } else {
            builder.bearer_auth(token)
        }
    }
}

/// Map a response onto the poll protocol: 204 no change, 404 gone, other
/// 2xx a JSON body, anything else an error.
pub(crate) async fn read_outcome<T: DeserializeOwned>(
    response: Response,
) -> Result<PollOutcome<T>, SourceError> {
    match response.status() {
        StatusCode::NO_CONTENT => Ok(PollOutcome::NoChange),
        StatusCode::NOT_FOUND => Ok(PollOutcome::NotFound),
        status if status.is_success() => response
            .json::<T>()
            .await
            .map(PollOutcome::Updated)
            .map_err(|e| SourceError::Decode(e.to_string())),
        status => Err(SourceError::Status(status.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_route_and_encodes_tail() {
        let http = HttpEndpoint::new("https://dash.example/api/").unwrap();
        let url = http.url("v1/tasks", &["job 7/a", "progress"]);
        assert_eq!(
            url.as_str(),
            "https://dash.example/api/v1/tasks/job%207%2Fa/progress"
        );
    }

    #[test]
    fn url_without_base_path() {
        let http = HttpEndpoint::new("http://127.0.0.1:8080").unwrap();
        assert_eq!(
            http.url("/notifications", &[]).as_str(),
            "http://127.0.0.1:8080/notifications"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(matches!(
            HttpEndpoint::new("not a url"),
            Err(SourceError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpEndpoint::new("mailto:ops@example.com"),
            Err(SourceError::InvalidUrl(_))
        ));
    }
}
