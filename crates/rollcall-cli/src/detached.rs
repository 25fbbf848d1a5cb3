use async_trait::async_trait;
use rollcall_core::models::RawRecord;
use rollcall_core::sync::{ChangeFeed, RemoteErrorDetail, RemoteResult, RemoteStore};
use rollcall_core::{EntityId, EntityKind};

const NOT_CONFIGURED: &str = "Remote is not configured";

/// Stand-in remote for local-only use.
///
/// Every call fails, so the engine stays offline and keeps writes in the
/// local cache until a later `rollcall sync` pushes them.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedRemote;

#[async_trait]
impl RemoteStore for DetachedRemote {
    async fn fetch_all(&self, _kind: EntityKind) -> RemoteResult<Vec<RawRecord>> {
        Err(RemoteErrorDetail::new(NOT_CONFIGURED))
    }

    async fn commit_batch(
        &self,
        _kind: EntityKind,
        _records: Vec<RawRecord>,
    ) -> RemoteResult<Vec<RawRecord>> {
        Err(RemoteErrorDetail::new(NOT_CONFIGURED))
    }

    async fn delete(&self, _kind: EntityKind, _id: EntityId) -> RemoteResult<()> {
        Err(RemoteErrorDetail::new(NOT_CONFIGURED))
    }

    async fn subscribe(&self, _kind: EntityKind) -> RemoteResult<ChangeFeed> {
        Err(RemoteErrorDetail::new(NOT_CONFIGURED))
    }

    async fn unsubscribe(&self, _kind: EntityKind) {}

    async fn probe(&self) -> RemoteResult<()> {
        Err(RemoteErrorDetail::new(NOT_CONFIGURED))
    }

    fn supports_change_feed(&self) -> bool {
        false
    }
}
