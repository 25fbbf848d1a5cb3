//! Local cache of entity snapshots.
//!
//! The cache is the only state read by collaborators. Every mutation goes
//! through [`LocalCache::transaction`], which applies the change to a draft,
//! persists the touched kinds in one store transaction, then publishes the
//! draft and fires change notifications. Writes of tombstoned ids are dropped
//! inside the draft, so no path can resurrect a deleted entity.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use super::observer::ChangeNotifier;
use super::persist::Persistence;
use super::{SyncResult, TombstoneSet};
use crate::models::{Entity, EntityId, EntityKind, Field, Group, Setting, User};

type Snapshot = HashMap<EntityKind, Vec<Entity>>;

pub struct LocalCache {
    entries: Mutex<Snapshot>,
    tombstones: Arc<TombstoneSet>,
    persistence: Arc<Persistence>,
    notifier: ChangeNotifier,
    write_lock: tokio::sync::Mutex<()>,
}

impl LocalCache {
    pub(crate) async fn load(
        persistence: Arc<Persistence>,
        tombstones: Arc<TombstoneSet>,
        notifier: ChangeNotifier,
    ) -> Self {
        let mut snapshot = Snapshot::new();
        for kind in EntityKind::ALL {
            let entities = match persistence.load(kind.cache_key()).await {
                Some(raw) => decode_snapshot(kind, &raw, &tombstones),
                None => Vec::new(),
            };
            tracing::debug!(%kind, count = entities.len(), "Loaded cached entities");
            snapshot.insert(kind, entities);
        }

        Self {
            entries: Mutex::new(snapshot),
            tombstones,
            persistence,
            notifier,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Entities of a kind in insertion order
    pub fn get(&self, kind: EntityKind) -> Vec<Entity> {
        self.lock().get(&kind).cloned().unwrap_or_default()
    }

    pub fn find(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        self.lock()
            .get(&kind)?
            .iter()
            .find(|entity| entity.id() == id)
            .cloned()
    }

    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.find(kind, id).is_some()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    pub fn users(&self) -> Vec<User> {
        self.get(EntityKind::User)
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::User(user) => Some(user),
                _ => None,
            })
            .collect()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.get(EntityKind::Group)
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Group(group) => Some(group),
                _ => None,
            })
            .collect()
    }

    pub fn fields(&self) -> Vec<Field> {
        self.get(EntityKind::Field)
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Field(field) => Some(field),
                _ => None,
            })
            .collect()
    }

    pub fn setting(&self) -> Option<Setting> {
        self.get(EntityKind::Setting)
            .into_iter()
            .find_map(|entity| match entity {
                Entity::Setting(setting) => Some(setting),
                _ => None,
            })
    }

    pub fn user(&self, id: EntityId) -> Option<User> {
        match self.find(EntityKind::User, id)? {
            Entity::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn group(&self, id: EntityId) -> Option<Group> {
        match self.find(EntityKind::Group, id)? {
            Entity::Group(group) => Some(group),
            _ => None,
        }
    }

    /// Upsert by id; returns false when the id is tombstoned
    pub async fn put(&self, entity: Entity) -> SyncResult<bool> {
        self.transaction(|draft| Ok(draft.upsert(entity))).await
    }

    /// Upsert several entities atomically; returns how many were kept
    pub async fn put_many(&self, entities: Vec<Entity>) -> SyncResult<usize> {
        self.transaction(|draft| {
            Ok(entities
                .into_iter()
                .filter(|entity| {
                    draft.upsert(entity.clone()) || draft.contains(entity.kind(), entity.id())
                })
                .count())
        })
        .await
    }

    pub async fn remove(&self, kind: EntityKind, id: EntityId) -> SyncResult<Option<Entity>> {
        self.transaction(|draft| Ok(draft.remove(kind, id))).await
    }

    /// Replace a kind's contents; tombstoned entities are dropped
    pub async fn replace_all(&self, kind: EntityKind, entities: Vec<Entity>) -> SyncResult<usize> {
        self.transaction(|draft| Ok(draft.replace_all(kind, entities))).await
    }

    /// Apply `change` atomically.
    ///
    /// Nothing is published if `change` fails or the touched kinds cannot be
    /// persisted.
    pub async fn transaction<R>(
        &self,
        change: impl FnOnce(&mut CacheDraft<'_>) -> SyncResult<R>,
    ) -> SyncResult<R> {
        let _guard = self.write_lock.lock().await;
        let mut draft = CacheDraft {
            snapshot: self.lock().clone(),
            touched: BTreeSet::new(),
            tombstones: &self.tombstones,
        };

        let result = change(&mut draft)?;
        if draft.touched.is_empty() {
            return Ok(result);
        }

        let mut writes = Vec::with_capacity(draft.touched.len());
        for kind in &draft.touched {
            let entities = draft.snapshot.get(kind).map_or(&[][..], Vec::as_slice);
            writes.push((kind.cache_key().to_string(), serde_json::to_string(entities)?));
        }
        self.persistence.save_many(writes).await?;

        let CacheDraft {
            snapshot, touched, ..
        } = draft;
        *self.lock() = snapshot;
        for kind in touched {
            self.notifier.notify(kind);
        }
        Ok(result)
    }

    /// Whether the last write fell back to memory-only mode
    pub fn is_memory_only(&self) -> bool {
        self.persistence.is_memory_only()
    }

    /// Deliver coalesced change notifications immediately
    pub fn flush_notifications(&self) {
        self.notifier.flush();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode_snapshot(kind: EntityKind, raw: &str, tombstones: &TombstoneSet) -> Vec<Entity> {
    let values: Vec<Value> = match serde_json::from_str(raw) {
        Ok(values) => values,
        Err(error) => {
            tracing::warn!(%kind, %error, "Discarding unreadable cache snapshot");
            return Vec::new();
        }
    };

    values
        .into_iter()
        .filter_map(|value| match Entity::from_value(kind, value) {
            Ok(entity) if tombstones.is_deleted(kind, entity.id()) => None,
            Ok(entity) => Some(entity),
            Err(error) => {
                tracing::warn!(%kind, %error, "Skipping unreadable cached entity");
                None
            }
        })
        .collect()
}

/// Mutable view of the cache inside a transaction
pub struct CacheDraft<'a> {
    snapshot: Snapshot,
    touched: BTreeSet<EntityKind>,
    tombstones: &'a TombstoneSet,
}

impl CacheDraft<'_> {
    pub fn get(&self, kind: EntityKind) -> &[Entity] {
        self.snapshot.get(&kind).map_or(&[][..], Vec::as_slice)
    }

    pub fn find(&self, kind: EntityKind, id: EntityId) -> Option<&Entity> {
        self.get(kind).iter().find(|entity| entity.id() == id)
    }

    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.find(kind, id).is_some()
    }

    pub fn user(&self, id: EntityId) -> Option<&User> {
        self.find(EntityKind::User, id).and_then(Entity::as_user)
    }

    pub fn group(&self, id: EntityId) -> Option<&Group> {
        self.find(EntityKind::Group, id).and_then(Entity::as_group)
    }

    pub fn is_tombstoned(&self, kind: EntityKind, id: EntityId) -> bool {
        self.tombstones.is_deleted(kind, id)
    }

    /// Insert or replace by id.
    ///
    /// Returns false, leaving the draft untouched, when the id is tombstoned
    /// or the stored entity is already identical.
    pub fn upsert(&mut self, entity: Entity) -> bool {
        let kind = entity.kind();
        let id = entity.id();
        if self.tombstones.is_deleted(kind, id) {
            tracing::debug!(%kind, %id, "Dropped write of tombstoned entity");
            return false;
        }

        let entities = self.snapshot.entry(kind).or_default();
        match entities.iter_mut().find(|existing| existing.id() == id) {
            Some(existing) if *existing == entity => return false,
            Some(existing) => *existing = entity,
            None => entities.push(entity),
        }
        self.touched.insert(kind);
        true
    }

    pub fn remove(&mut self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        let entities = self.snapshot.get_mut(&kind)?;
        let position = entities.iter().position(|entity| entity.id() == id)?;
        self.touched.insert(kind);
        Some(entities.remove(position))
    }

    /// Replace a kind's contents; returns how many entities were kept
    pub fn replace_all(&mut self, kind: EntityKind, entities: Vec<Entity>) -> usize {
        let tombstones = self.tombstones;
        let kept: Vec<Entity> = entities
            .into_iter()
            .filter(|entity| entity.kind() == kind && !tombstones.is_deleted(kind, entity.id()))
            .collect();
        let count = kept.len();
        if self.get(kind) != kept.as_slice() {
            self.snapshot.insert(kind, kept);
            self.touched.insert(kind);
        }
        count
    }

    /// Apply `edit` to every user, marking the kind touched if any changed
    pub fn update_users(&mut self, mut edit: impl FnMut(&mut User) -> bool) -> usize {
        let mut changed = 0;
        if let Some(entities) = self.snapshot.get_mut(&EntityKind::User) {
            for user in entities.iter_mut().filter_map(Entity::as_user_mut) {
                if edit(user) {
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.touched.insert(EntityKind::User);
        }
        changed
    }

    /// Apply `edit` to every group, marking the kind touched if any changed
    pub fn update_groups(&mut self, mut edit: impl FnMut(&mut Group) -> bool) -> usize {
        let mut changed = 0;
        if let Some(entities) = self.snapshot.get_mut(&EntityKind::Group) {
            for group in entities.iter_mut().filter_map(Entity::as_group_mut) {
                if edit(group) {
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.touched.insert(EntityKind::Group);
        }
        changed
    }

    /// Replace a provisional id with the remote-assigned one, rewriting
    /// references held by other entities.
    pub fn rekey(&mut self, kind: EntityKind, from: EntityId, to: EntityId) -> bool {
        if from == to {
            return false;
        }
        let Some(mut entity) = self.remove(kind, from) else {
            return false;
        };
        if !self.contains(kind, to) {
            entity.set_id(to);
            self.upsert(entity);
        }

        match kind {
            EntityKind::Group => {
                self.update_users(|user| {
                    if user.group_id == Some(from) {
                        user.group_id = Some(to);
                        true
                    } else {
                        false
                    }
                });
            }
            EntityKind::User => {
                self.update_groups(|group| {
                    let mut changed = false;
                    for member in &mut group.members {
                        if *member == from {
                            *member = to;
                            changed = true;
                        }
                    }
                    if group.leader_id == Some(from) {
                        group.leader_id = Some(to);
                        changed = true;
                    }
                    changed
                });
            }
            EntityKind::Field | EntityKind::Setting => {}
        }
        true
    }

    /// Clear every reference to a deleted user
    pub fn detach_user(&mut self, user_id: EntityId) -> usize {
        self.update_groups(|group| group.remove_member(user_id))
    }

    /// Clear every reference to a deleted group
    pub fn detach_group(&mut self, group_id: EntityId) -> usize {
        self.update_users(|user| {
            if user.group_id == Some(group_id) {
                user.group_id = None;
                user.dynamic_fields.is_leader = false;
                true
            } else {
                false
            }
        })
    }
}
