use std::io;

/// Failures writing to (or watching) a shared store backend.
///
/// Reads never fail: a missing or unreadable key is reported as absent.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize value for key {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to watch store directory: {0}")]
    Watch(#[from] notify::Error),
}

/// Failures talking to a subject's remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("server responded with status {0}")]
    Status(u16),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed response body: {0}")]
    Decode(String),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
}

impl SourceError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Why a leader gave up on a subject.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollFailure {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("no bearer token after {attempts} attempts")]
    Credentials { attempts: u32 },
}
