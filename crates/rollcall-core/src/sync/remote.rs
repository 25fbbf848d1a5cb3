//! Port to the authoritative remote store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::RemoteErrorDetail;
use crate::models::{EntityId, EntityKind, RawRecord};

/// Mutation type carried by a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One remote mutation delivered by a change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub kind: EntityKind,
    pub id: EntityId,
    /// New row for inserts and updates
    #[serde(default)]
    pub record: Option<RawRecord>,
}

impl ChangeEvent {
    #[must_use]
    pub const fn insert(kind: EntityKind, id: EntityId, record: RawRecord) -> Self {
        Self {
            op: ChangeOp::Insert,
            kind,
            id,
            record: Some(record),
        }
    }

    #[must_use]
    pub const fn update(kind: EntityKind, id: EntityId, record: RawRecord) -> Self {
        Self {
            op: ChangeOp::Update,
            kind,
            id,
            record: Some(record),
        }
    }

    #[must_use]
    pub const fn delete(kind: EntityKind, id: EntityId) -> Self {
        Self {
            op: ChangeOp::Delete,
            kind,
            id,
            record: None,
        }
    }
}

/// Live stream of remote mutations for one kind
///
/// An `Err` item or a closed channel means the subscription was lost.
pub type ChangeFeed = mpsc::Receiver<Result<ChangeEvent, RemoteErrorDetail>>;

pub type RemoteResult<T> = Result<T, RemoteErrorDetail>;

/// Remote operations consumed by the sync core
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every row of a kind
    async fn fetch_all(&self, kind: EntityKind) -> RemoteResult<Vec<RawRecord>>;

    /// Bulk upsert; returns canonical rows in input order
    async fn commit_batch(
        &self,
        kind: EntityKind,
        records: Vec<RawRecord>,
    ) -> RemoteResult<Vec<RawRecord>>;

    async fn delete(&self, kind: EntityKind, id: EntityId) -> RemoteResult<()>;

    async fn subscribe(&self, kind: EntityKind) -> RemoteResult<ChangeFeed>;

    async fn unsubscribe(&self, kind: EntityKind);

    /// Lightweight reachability check
    async fn probe(&self) -> RemoteResult<()>;

    /// Whether `subscribe` can deliver live events
    fn supports_change_feed(&self) -> bool {
        true
    }
}
