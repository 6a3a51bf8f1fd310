//! Where subject state ends up on screen.

use std::time::Duration;

use crate::subject::SubjectId;

/// How a tracked subject ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Terminal payload observed.
    Success,
    /// The server no longer knows the subject. Shown as a quiet completion.
    Vanished,
    /// Gave up after an error. The UI keeps an error affordance around.
    Interrupted { reason: String },
}

impl Completion {
    /// How long the finished element stays visible. `None` means until the
    /// user dismisses it.
    pub fn linger(&self) -> Option<Duration> {
        match self {
            Self::Success => Some(Duration::from_secs(4)),
            Self::Vanished => Some(Duration::ZERO),
            Self::Interrupted { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// UI collaborator for one subject kind.
pub trait ProgressSink<P>: Send + Sync + 'static {
    /// Show `payload` in place of whatever was shown before.
    fn update(&self, id: &SubjectId, payload: &P);

    fn finish(&self, id: &SubjectId, completion: Completion);

    /// Ask lists that depend on the subject to reload.
    fn refresh_downstream(&self, id: &SubjectId) {
        let _ = id;
    }
}
