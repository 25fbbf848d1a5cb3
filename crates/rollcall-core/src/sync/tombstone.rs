//! Deletion tombstones.
//!
//! A tombstoned `(kind, id)` pair must never be re-materialized in the local
//! cache. The set is persisted under its own key so a crash between the local
//! delete and the remote confirmation cannot bring the entity back.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::persist::Persistence;
use super::SyncResult;
use crate::models::{EntityId, EntityKind};

pub(crate) const TOMBSTONES_KEY: &str = "tombstones";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tombstone {
    pub kind: EntityKind,
    pub id: EntityId,
}

pub struct TombstoneSet {
    entries: Mutex<HashSet<Tombstone>>,
    persistence: Arc<Persistence>,
    write_lock: tokio::sync::Mutex<()>,
}

impl TombstoneSet {
    pub(crate) async fn load(persistence: Arc<Persistence>) -> Self {
        let entries = match persistence.load(TOMBSTONES_KEY).await {
            Some(raw) => serde_json::from_str::<Vec<Tombstone>>(&raw).unwrap_or_else(|error| {
                tracing::warn!(%error, "Discarding unreadable tombstone snapshot");
                Vec::new()
            }),
            None => Vec::new(),
        };
        tracing::debug!(count = entries.len(), "Loaded tombstones");

        Self {
            entries: Mutex::new(entries.into_iter().collect()),
            persistence,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether `(kind, id)` was deleted
    pub fn is_deleted(&self, kind: EntityKind, id: EntityId) -> bool {
        self.lock().contains(&Tombstone { kind, id })
    }

    /// Record a deletion; returns whether the id was newly tombstoned
    pub async fn mark_deleted(&self, kind: EntityKind, id: EntityId) -> SyncResult<bool> {
        let _guard = self.write_lock.lock().await;
        let tombstone = Tombstone { kind, id };
        if !self.lock().insert(tombstone) {
            return Ok(false);
        }

        if let Err(error) = self.persist().await {
            self.lock().remove(&tombstone);
            return Err(error);
        }
        tracing::debug!(%kind, %id, "Tombstoned");
        Ok(true)
    }

    /// Forget a deletion once the remote no longer has the id
    pub async fn clear(&self, kind: EntityKind, id: EntityId) -> SyncResult<bool> {
        let _guard = self.write_lock.lock().await;
        let tombstone = Tombstone { kind, id };
        if !self.lock().remove(&tombstone) {
            return Ok(false);
        }

        if let Err(error) = self.persist().await {
            self.lock().insert(tombstone);
            return Err(error);
        }
        tracing::debug!(%kind, %id, "Cleared tombstone");
        Ok(true)
    }

    /// Undo a fresh mark whose cache removal failed
    pub(crate) async fn roll_back(&self, kind: EntityKind, id: EntityId) {
        if let Err(error) = self.clear(kind, id).await {
            tracing::warn!(%kind, %id, %error, "Failed to roll back tombstone");
        }
    }

    /// Drop every tombstone
    pub async fn clear_all(&self) -> SyncResult<usize> {
        let _guard = self.write_lock.lock().await;
        let previous = std::mem::take(&mut *self.lock());
        if let Err(error) = self.persist().await {
            *self.lock() = previous;
            return Err(error);
        }
        Ok(previous.len())
    }

    /// Tombstones, sorted by kind then id
    pub fn list(&self) -> Vec<Tombstone> {
        let mut entries: Vec<_> = self.lock().iter().copied().collect();
        entries.sort();
        entries
    }

    /// Tombstoned ids of one kind
    pub fn ids(&self, kind: EntityKind) -> Vec<EntityId> {
        let mut ids: Vec<_> = self
            .lock()
            .iter()
            .filter(|tombstone| tombstone.kind == kind)
            .map(|tombstone| tombstone.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    async fn persist(&self) -> SyncResult<()> {
        let payload = serde_json::to_string(&self.list())?;
        self.persistence.save(TOMBSTONES_KEY, payload).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<Tombstone>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{MemoryStore, RecordingObserver};
    use crate::sync::SyncError;

    async fn setup(store: Arc<MemoryStore>) -> TombstoneSet {
        let persistence = Arc::new(Persistence::new(
            store,
            Arc::new(RecordingObserver::default()),
        ));
        TombstoneSet::load(persistence).await
    }

    #[tokio::test]
    async fn marks_survive_reload() {
        let store = Arc::new(MemoryStore::default());
        let tombstones = setup(store.clone()).await;

        assert!(tombstones
            .mark_deleted(EntityKind::User, EntityId::new(7))
            .await
            .unwrap());
        assert!(!tombstones
            .mark_deleted(EntityKind::User, EntityId::new(7))
            .await
            .unwrap());

        let reloaded = setup(store).await;
        assert!(reloaded.is_deleted(EntityKind::User, EntityId::new(7)));
        assert!(!reloaded.is_deleted(EntityKind::Group, EntityId::new(7)));
    }

    #[tokio::test]
    async fn clear_forgets_the_id() {
        let store = Arc::new(MemoryStore::default());
        let tombstones = setup(store).await;

        tombstones
            .mark_deleted(EntityKind::Group, EntityId::new(3))
            .await
            .unwrap();
        assert!(tombstones
            .clear(EntityKind::Group, EntityId::new(3))
            .await
            .unwrap());
        assert!(!tombstones.is_deleted(EntityKind::Group, EntityId::new(3)));
        assert!(tombstones.is_empty());
    }

    #[tokio::test]
    async fn failed_persist_rolls_back_the_mark() {
        let store = Arc::new(MemoryStore::default());
        let tombstones = setup(store.clone()).await;

        store.set_failing(true);
        let result = tombstones
            .mark_deleted(EntityKind::User, EntityId::new(1))
            .await;

        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert!(!tombstones.is_deleted(EntityKind::User, EntityId::new(1)));
    }
}
