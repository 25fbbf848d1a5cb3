//! Offline-tolerant sync between the local cache and the remote store.
//!
//! Local writes land in the [`LocalCache`] first and reach the remote through
//! the [`WriteBatcher`] and [`ConflictResolver`]. Remote state flows back via
//! the [`RemoteReconciler`] and the [`ChangeStreamConsumer`], while the
//! [`HealthMonitor`] tracks connectivity. [`SyncEngine`] wires them together
//! around one [`SyncContext`].

mod batcher;
mod cache;
mod context;
mod diagnostics;
mod engine;
mod error;
mod health;
mod http;
mod observer;
mod outbox;
mod persist;
mod reconciler;
mod remote;
mod resolver;
mod retry;
mod roster;
mod stream;
#[cfg(test)]
mod testing;
mod tombstone;

pub use batcher::{FlushReport, WriteBatcher};
pub use cache::{CacheDraft, LocalCache};
pub use context::SyncContext;
pub use diagnostics::{DiagnosticEntry, DiagnosticLog};
pub use engine::{SyncEngine, SyncStatus};
pub use error::{ConflictReason, ErrorKind, RemoteErrorDetail, SyncError, SyncResult};
pub use health::{HealthMonitor, HealthOutcome};
pub use http::HttpRemoteStore;
pub use observer::{NoopObserver, Severity, SyncObserver};
pub use outbox::{Outbox, PendingWrite};
pub use reconciler::{KindReconcile, ReconcileReport, RemoteReconciler};
pub use remote::{ChangeEvent, ChangeFeed, ChangeOp, RemoteResult, RemoteStore};
pub use resolver::ConflictResolver;
pub use retry::{Backoff, RetryPolicy};
pub use stream::ChangeStreamConsumer;
pub use tombstone::{Tombstone, TombstoneSet};
