//! Terminal renderings of what the coordinators report.

use std::sync::Mutex;
use tracing::{debug, info, warn};

use tabwatch::{Completion, InboxEnvelope, Progress, ProgressSink, ProgressSnapshot, SubjectId};

/// Prints one line per job update.
pub struct TerminalSink;

impl ProgressSink<ProgressSnapshot> for TerminalSink {
    fn update(&self, id: &SubjectId, payload: &ProgressSnapshot) {
        debug!(subject = %id, status = %payload.status, "job update");
        println!("{}", render_progress(id, payload));
    }

    fn finish(&self, id: &SubjectId, completion: Completion) {
        if completion.is_error() {
            warn!(subject = %id, ?completion, "job tracking interrupted");
        } else {
            info!(subject = %id, ?completion, linger = ?completion.linger(), "job tracking finished");
        }
        println!("{}", render_completion(id, &completion));
    }

    fn refresh_downstream(&self, id: &SubjectId) {
        info!(subject = %id, "job finished, dependent views should reload");
    }
}

pub fn render_progress(id: &SubjectId, snapshot: &ProgressSnapshot) -> String {
    let gauge = match snapshot.progress {
        Progress::Percent(p) => format!("{p:>3}%"),
        Progress::Indeterminate => " ...".to_string(),
        Progress::Unknown => "   ?".to_string(),
    };
    let title = snapshot.title.as_deref().unwrap_or(id.as_str());
    match &snapshot.message {
        Some(message) => format!("[{gauge}] {title}: {} ({message})", snapshot.status),
        None => format!("[{gauge}] {title}: {}", snapshot.status),
    }
}

pub fn render_completion(id: &SubjectId, completion: &Completion) -> String {
    match completion {
        Completion::Success => format!("[done] {id}"),
        Completion::Vanished => format!("[gone] {id} no longer exists"),
        Completion::Interrupted { reason } => format!("[fail] {id}: {reason}"),
    }
}

/// Prints newly arrived notifications.
#[derive(Default)]
pub struct InboxSink {
    last: Mutex<Option<InboxEnvelope>>,
}

impl ProgressSink<InboxEnvelope> for InboxSink {
    fn update(&self, _id: &SubjectId, inbox: &InboxEnvelope) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = match last.as_ref() {
            Some(previous) => inbox.new_since(previous),
            None => inbox.notifications.iter().collect(),
        };
        for note in fresh {
            println!("{} {}", if note.read { " " } else { "*" }, note.title);
        }
        println!("({} unread)", inbox.unread());
        *last = Some(inbox.clone());
    }

    fn finish(&self, id: &SubjectId, completion: Completion) {
        println!("{}", render_completion(id, &completion));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(progress: Progress, message: Option<&str>) -> ProgressSnapshot {
        ProgressSnapshot {
            status: "rendering".into(),
            title: Some("Quarterly report".into()),
            message: message.map(str::to_string),
            progress,
            ..Default::default()
        }
    }

    #[test]
    fn test_render_progress_variants() {
        let id = SubjectId::from("r-1");
        assert_eq!(
            render_progress(&id, &job(Progress::Percent(7), None)),
            "[  7%] Quarterly report: rendering"
        );
        assert_eq!(
            render_progress(&id, &job(Progress::Indeterminate, Some("page 3"))),
            "[ ...] Quarterly report: rendering (page 3)"
        );

        let untitled = ProgressSnapshot {
            title: None,
            ..job(Progress::Unknown, None)
        };
        assert_eq!(render_progress(&id, &untitled), "[   ?] r-1: rendering");
    }

    #[test]
    fn test_render_completion() {
        let id = SubjectId::from("r-1");
        assert_eq!(render_completion(&id, &Completion::Success), "[done] r-1");
        assert_eq!(
            render_completion(
                &id,
                &Completion::Interrupted {
                    reason: "server responded with status 502".into()
                }
            ),
            "[fail] r-1: server responded with status 502"
        );
    }
}
