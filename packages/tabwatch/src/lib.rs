//! Tabwatch - leader-coordinated polling of long-running server jobs
//!
//! Several client instances (browser tabs, terminal sessions, ...) share one
//! synchronous key/value store that broadcasts changes to the *other*
//! attachments. For every tracked subject exactly one instance holds a
//! best-effort lease and long-polls the server; everyone else mirrors the
//! snapshots the leader writes to the store.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabwatch::store::MemoryHub;
//! use tabwatch::{Completion, Coordinator, ProgressSink, ProgressSnapshot, ProgressSource, SubjectId};
//!
//! struct Printer;
//!
//! impl ProgressSink<ProgressSnapshot> for Printer {
//!     fn update(&self, id: &SubjectId, payload: &ProgressSnapshot) {
//!         println!("{id}: {}", payload.status);
//!     }
//!     fn finish(&self, id: &SubjectId, completion: Completion) {
//!         println!("{id}: finished ({completion:?})");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = MemoryHub::new();
//!     let source = ProgressSource::new("https://dashboard.example", "api/tasks").unwrap();
//!     let coordinator = Coordinator::builder(Arc::new(hub.attach()), source, Arc::new(Printer)).build();
//!
//!     coordinator.track("report-42");
//!     coordinator.wait_idle().await;
//! }
//! ```

pub mod cache;
pub mod clock;
mod coordinator;
pub mod credentials;
mod engine;
mod error;
mod follower;
mod http;
pub mod inbox;
pub mod lease;
pub mod metrics;
pub mod pending;
pub mod progress;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod store;
mod subject;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use coordinator::{
    Coordinator, CoordinatorBuilder, CoordinatorSettings, Role, SubjectStatus, Tracking,
};
pub use error::{PollFailure, SourceError, StoreError};
pub use http::HttpEndpoint;
pub use inbox::{INBOX_SUBJECT, InboxClient, InboxEnvelope, InboxSource, Notification};
pub use progress::{Progress, ProgressSnapshot, ProgressSource};
pub use sink::{Completion, ProgressSink};
pub use source::{Backoff, BackoffPolicy, Cadence, PollOutcome, SubjectSource};
pub use subject::{KeyClass, Keyspace, Revision, SubjectId};
