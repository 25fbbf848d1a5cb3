//! Local writes the remote has not confirmed yet.
//!
//! The batcher queue lives in memory, so the `(kind, id)` of every queued,
//! retrying or parked write is also kept here under its own key. After a
//! restart the outbox is read back and the cached copies are queued again.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::persist::Persistence;
use super::SyncResult;
use crate::models::{EntityId, EntityKind};

pub(crate) const OUTBOX_KEY: &str = "outbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingWrite {
    pub kind: EntityKind,
    pub id: EntityId,
}

pub struct Outbox {
    entries: Mutex<BTreeSet<PendingWrite>>,
    persistence: Arc<Persistence>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Outbox {
    pub(crate) async fn load(persistence: Arc<Persistence>) -> Self {
        let entries = match persistence.load(OUTBOX_KEY).await {
            Some(raw) => serde_json::from_str::<Vec<PendingWrite>>(&raw).unwrap_or_else(|error| {
                tracing::warn!(%error, "Discarding unreadable outbox snapshot");
                Vec::new()
            }),
            None => Vec::new(),
        };
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Loaded unsynced writes");
        }

        Self {
            entries: Mutex::new(entries.into_iter().collect()),
            persistence,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Note a pending write in memory; it is stored with the next save
    pub fn track(&self, kind: EntityKind, id: EntityId) -> bool {
        self.lock().insert(PendingWrite { kind, id })
    }

    /// Note pending writes and store the outbox
    pub async fn record(
        &self,
        writes: impl IntoIterator<Item = (EntityKind, EntityId)>,
    ) -> SyncResult<()> {
        for (kind, id) in writes {
            self.track(kind, id);
        }
        self.save().await
    }

    /// Forget writes the remote has confirmed or that will never be sent
    pub async fn settle(
        &self,
        writes: impl IntoIterator<Item = (EntityKind, EntityId)>,
    ) -> SyncResult<usize> {
        let removed = {
            let mut entries = self.lock();
            writes
                .into_iter()
                .filter(|(kind, id)| entries.remove(&PendingWrite { kind: *kind, id: *id }))
                .count()
        };
        if removed > 0 {
            self.save().await?;
        }
        Ok(removed)
    }

    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.lock().contains(&PendingWrite { kind, id })
    }

    /// Pending writes, sorted by kind then id
    pub fn list(&self) -> Vec<PendingWrite> {
        self.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Store the current contents; the latest state wins under the write lock
    async fn save(&self) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        let payload = serde_json::to_string(&self.list())?;
        self.persistence.save(OUTBOX_KEY, payload).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<PendingWrite>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
