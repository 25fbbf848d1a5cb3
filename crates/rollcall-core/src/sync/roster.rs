//! Roster editing on top of the sync engine.
//!
//! Every operation validates and applies its change to the local cache in a
//! single transaction, then queues the touched entities for the remote.

use super::{CacheDraft, SyncEngine, SyncError, SyncResult};
use crate::models::{
    Entity, EntityId, EntityKind, Field, Group, Setting, User, UserStatus, SETTINGS_ROW_ID,
};

/// Upsert `entity` into the draft with a fresh timestamp, recording it when
/// anything changed
fn stage(draft: &mut CacheDraft<'_>, changed: &mut Vec<Entity>, entity: impl Into<Entity>) {
    let mut entity = entity.into();
    entity.touch();
    if draft.upsert(entity.clone()) {
        changed.retain(|existing| {
            existing.kind() != entity.kind() || existing.id() != entity.id()
        });
        changed.push(entity);
    }
}

fn require_user(draft: &CacheDraft<'_>, id: EntityId) -> SyncResult<User> {
    draft
        .user(id)
        .cloned()
        .ok_or_else(|| SyncError::Validation(format!("User {id} not found")))
}

fn require_group(draft: &CacheDraft<'_>, id: EntityId) -> SyncResult<Group> {
    draft
        .group(id)
        .cloned()
        .ok_or_else(|| SyncError::Validation(format!("Group {id} not found")))
}

fn check_unique(draft: &CacheDraft<'_>, user: &User) -> SyncResult<()> {
    let clash = draft
        .get(EntityKind::User)
        .iter()
        .filter_map(Entity::as_user)
        .find_map(|other| user.unique_key_collision(other));
    match clash {
        Some(field) => Err(SyncError::unique(
            field,
            format!("{field} already used by another user"),
        )),
        None => Ok(()),
    }
}

/// Move `user` into `target`, leaving any previous group.
///
/// Stages every group that changed; the caller stages the user.
fn place_user(
    draft: &mut CacheDraft<'_>,
    changed: &mut Vec<Entity>,
    user: &mut User,
    target: Option<EntityId>,
) -> SyncResult<()> {
    let mut joining = match target {
        Some(group_id) => Some(require_group(draft, group_id)?),
        None => None,
    };
    if let Some(group) = joining.as_ref() {
        if !group.has_member(user.id) && group.is_full() {
            return Err(SyncError::Validation(format!(
                "Group {} is full ({} of {})",
                group.name,
                group.members.len(),
                group.capacity
            )));
        }
    }

    let leaving: Vec<Group> = draft
        .get(EntityKind::Group)
        .iter()
        .filter_map(Entity::as_group)
        .filter(|group| Some(group.id) != target && group.has_member(user.id))
        .cloned()
        .collect();
    for mut group in leaving {
        group.remove_member(user.id);
        stage(draft, changed, group);
    }

    if user.group_id != target {
        user.dynamic_fields.is_leader = false;
    }
    user.group_id = target;
    if let Some(mut group) = joining.take() {
        if !group.has_member(user.id) {
            group.members.push(user.id);
            stage(draft, changed, group);
        }
    }
    Ok(())
}

impl SyncEngine {
    async fn edit(
        &self,
        change: impl FnOnce(&mut CacheDraft<'_>, &mut Vec<Entity>) -> SyncResult<()>,
    ) -> SyncResult<Vec<Entity>> {
        let changed = self
            .ctx
            .cache()
            .transaction(|draft| {
                let mut changed = Vec::new();
                change(draft, &mut changed)?;
                Ok(changed)
            })
            .await?;
        let pending = changed.iter().map(|entity| (entity.kind(), entity.id()));
        if let Err(error) = self.ctx.outbox().record(pending).await {
            tracing::warn!(%error, "Failed to store unsynced writes");
        }
        for entity in &changed {
            self.batcher.enqueue(entity.clone());
        }
        Ok(changed)
    }

    /// Tombstone, drop locally, then delete remotely.
    ///
    /// A failed remote delete is reported; the tombstone keeps the entity
    /// hidden and reconciliation re-issues the delete later.
    async fn delete_entity(&self, kind: EntityKind, id: EntityId) -> SyncResult<()> {
        let cached = self.ctx.cache().contains(kind, id);
        if !cached && !self.ctx.tombstones().is_deleted(kind, id) {
            return Err(SyncError::Validation(format!("{} {id} not found", kind.label())));
        }

        let marked = self.ctx.tombstones().mark_deleted(kind, id).await?;
        let removed = self
            .edit(|draft, changed| {
                draft.remove(kind, id);
                detach(draft, changed, kind, id);
                Ok(())
            })
            .await;
        if let Err(error) = removed {
            if marked {
                self.ctx.tombstones().roll_back(kind, id).await;
            }
            return Err(error);
        }
        tracing::info!(%kind, %id, "Deleted locally");

        if !self.ctx.is_connected() {
            tracing::debug!(%kind, %id, "Offline; remote delete deferred");
            return Ok(());
        }
        if let Err(error) = self.resolver.delete(kind, id, None).await {
            self.ctx.report_error("delete", Some(kind), &error).await;
        }
        Ok(())
    }

    /// Add a new user, placing them in their group if one is set
    pub async fn create_user(&self, user: User) -> SyncResult<User> {
        let mut user = user.normalized();
        user.validate().map_err(SyncError::Validation)?;
        self.edit(|draft, changed| {
            if draft.contains(EntityKind::User, user.id) {
                return Err(SyncError::Validation(format!("User {} already exists", user.id)));
            }
            check_unique(draft, &user)?;
            user.dynamic_fields.is_leader = false;
            let target = user.group_id.take();
            place_user(draft, changed, &mut user, target)?;
            stage(draft, changed, user.clone());
            Ok(())
        })
        .await?;
        tracing::info!(id = %user.id, "Created user");
        Ok(user)
    }

    /// Replace a user's fields. A changed `group_id` moves them.
    pub async fn update_user(&self, user: User) -> SyncResult<User> {
        let mut user = user.normalized();
        user.validate().map_err(SyncError::Validation)?;
        self.edit(|draft, changed| {
            let current = require_user(draft, user.id)?;
            check_unique(draft, &user)?;
            if user.group_id == current.group_id {
                user.dynamic_fields.is_leader = current.dynamic_fields.is_leader;
            } else {
                let target = user.group_id;
                user.group_id = current.group_id;
                place_user(draft, changed, &mut user, target)?;
            }
            stage(draft, changed, user.clone());
            Ok(())
        })
        .await?;
        Ok(user)
    }

    pub async fn delete_user(&self, id: EntityId) -> SyncResult<()> {
        self.delete_entity(EntityKind::User, id).await
    }

    pub async fn create_group(&self, group: Group) -> SyncResult<Group> {
        let mut group = group;
        group.name = group.name.trim().to_string();
        group.members.clear();
        group.leader_id = None;
        group.validate().map_err(SyncError::Validation)?;
        self.edit(|draft, changed| {
            if draft.contains(EntityKind::Group, group.id) {
                return Err(SyncError::Validation(format!("Group {} already exists", group.id)));
            }
            stage(draft, changed, group.clone());
            Ok(())
        })
        .await?;
        tracing::info!(id = %group.id, "Created group");
        Ok(group)
    }

    /// Update name, capacity and flag; membership goes through the member
    /// operations
    pub async fn update_group(&self, group: Group) -> SyncResult<Group> {
        let mut updated = None;
        self.edit(|draft, changed| {
            let mut current = require_group(draft, group.id)?;
            current.name = group.name.trim().to_string();
            current.capacity = group.capacity;
            current.validate().map_err(SyncError::Validation)?;
            let flag_changed = current.flagged != group.flagged;
            current.flagged = group.flagged;
            if flag_changed {
                cascade_flag(draft, changed, &current);
            }
            stage(draft, changed, current.clone());
            updated = Some(current);
            Ok(())
        })
        .await?;
        updated.ok_or_else(|| SyncError::Validation(format!("Group {} not found", group.id)))
    }

    /// Delete a group; its members keep their records but lose the group
    pub async fn delete_group(&self, id: EntityId) -> SyncResult<()> {
        self.delete_entity(EntityKind::Group, id).await
    }

    /// Put a user in a group, moving them out of any other group.
    ///
    /// Rejected when the group is at capacity.
    pub async fn add_member(&self, group_id: EntityId, user_id: EntityId) -> SyncResult<()> {
        self.move_member(user_id, Some(group_id)).await
    }

    pub async fn remove_member(&self, group_id: EntityId, user_id: EntityId) -> SyncResult<()> {
        self.edit(|draft, changed| {
            let mut group = require_group(draft, group_id)?;
            if !group.remove_member(user_id) {
                return Ok(());
            }
            stage(draft, changed, group);
            if let Some(mut user) = draft.user(user_id).cloned() {
                if user.group_id == Some(group_id) {
                    user.group_id = None;
                    user.dynamic_fields.is_leader = false;
                    stage(draft, changed, user);
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Move a user to `target`, or out of every group with `None`
    pub async fn move_member(&self, user_id: EntityId, target: Option<EntityId>) -> SyncResult<()> {
        self.edit(|draft, changed| {
            let mut user = require_user(draft, user_id)?;
            place_user(draft, changed, &mut user, target)?;
            stage(draft, changed, user);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Make `leader` the only leader of the group, or clear the slot.
    ///
    /// The old leader's flag, the new leader's flag and the group change in
    /// one transaction.
    pub async fn set_leader(&self, group_id: EntityId, leader: Option<EntityId>) -> SyncResult<()> {
        self.edit(|draft, changed| {
            let mut group = require_group(draft, group_id)?;
            if let Some(leader) = leader {
                if !group.has_member(leader) {
                    return Err(SyncError::Validation(format!(
                        "User {leader} is not a member of {}",
                        group.name
                    )));
                }
            }

            let members: Vec<User> = draft
                .get(EntityKind::User)
                .iter()
                .filter_map(Entity::as_user)
                .filter(|user| user.group_id == Some(group_id) || group.has_member(user.id))
                .cloned()
                .collect();
            for mut user in members {
                let is_leader = Some(user.id) == leader;
                if user.dynamic_fields.is_leader != is_leader {
                    user.dynamic_fields.is_leader = is_leader;
                    stage(draft, changed, user);
                }
            }

            if group.leader_id != leader {
                group.leader_id = leader;
                stage(draft, changed, group);
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Create enough groups of `capacity` to seat every user, named
    /// "Group A", "Group B" and so on after any existing groups
    pub async fn generate_groups(&self, capacity: u32) -> SyncResult<Vec<Group>> {
        if capacity == 0 {
            return Err(SyncError::Validation("Group size must be at least 1".to_string()));
        }

        let mut created = Vec::new();
        self.edit(|draft, changed| {
            let users = draft.get(EntityKind::User).len();
            let existing = draft.get(EntityKind::Group).len();
            for index in existing..existing + users.div_ceil(capacity as usize) {
                let group = Group::new(group_label(index), capacity);
                stage(draft, changed, group.clone());
                created.push(group);
            }
            Ok(())
        })
        .await?;
        tracing::info!(count = created.len(), capacity, "Generated groups");
        Ok(created)
    }

    /// Spread every user over the existing groups round-robin.
    ///
    /// Memberships and leaders are reset first. Full groups are skipped;
    /// users left over once every group is full end up without a group.
    /// Everything lands in one transaction and one batch per kind. Returns
    /// how many users were placed.
    pub async fn auto_assign(&self) -> SyncResult<usize> {
        let mut assigned = 0;
        let mut unassigned = 0;
        self.edit(|draft, changed| {
            let mut groups: Vec<Group> = draft
                .get(EntityKind::Group)
                .iter()
                .filter_map(Entity::as_group)
                .cloned()
                .collect();
            if groups.is_empty() {
                return Err(SyncError::Validation("Create groups before assigning users".to_string()));
            }
            for group in &mut groups {
                group.members.clear();
                group.leader_id = None;
            }

            let users: Vec<User> = draft
                .get(EntityKind::User)
                .iter()
                .filter_map(Entity::as_user)
                .cloned()
                .collect();
            let mut next = 0;
            for mut user in users {
                let slot = (0..groups.len())
                    .map(|offset| (next + offset) % groups.len())
                    .find(|index| !groups[*index].is_full());
                let before = (user.group_id, user.dynamic_fields.is_leader);
                user.dynamic_fields.is_leader = false;
                if let Some(index) = slot {
                    groups[index].members.push(user.id);
                    user.group_id = Some(groups[index].id);
                    next = index + 1;
                    assigned += 1;
                } else {
                    user.group_id = None;
                    unassigned += 1;
                }
                if before != (user.group_id, user.dynamic_fields.is_leader) {
                    stage(draft, changed, user);
                }
            }
            for group in groups {
                stage(draft, changed, group);
            }
            Ok(())
        })
        .await?;
        tracing::info!(assigned, unassigned, "Auto-assigned users to groups");
        Ok(assigned)
    }

    /// Flag or unflag a group, cascading the status to its members
    pub async fn set_group_flagged(&self, group_id: EntityId, flagged: bool) -> SyncResult<()> {
        self.edit(|draft, changed| {
            let mut group = require_group(draft, group_id)?;
            if group.flagged == flagged {
                return Ok(());
            }
            group.flagged = flagged;
            cascade_flag(draft, changed, &group);
            stage(draft, changed, group);
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn upsert_field(&self, field: Field) -> SyncResult<Field> {
        let mut field = field;
        field.name = field.name.trim().to_string();
        field.validate().map_err(SyncError::Validation)?;
        self.edit(|draft, changed| {
            stage(draft, changed, field.clone());
            Ok(())
        })
        .await?;
        Ok(field)
    }

    pub async fn delete_field(&self, id: EntityId) -> SyncResult<()> {
        self.delete_entity(EntityKind::Field, id).await
    }

    /// Save the singleton registration settings
    pub async fn save_setting(&self, setting: Setting) -> SyncResult<Setting> {
        let mut setting = setting;
        setting.id = SETTINGS_ROW_ID;
        setting.validate().map_err(SyncError::Validation)?;
        self.edit(|draft, changed| {
            stage(draft, changed, setting.clone());
            Ok(())
        })
        .await?;
        Ok(setting)
    }
}

fn group_label(index: usize) -> String {
    match u8::try_from(index) {
        Ok(offset) if offset < 26 => format!("Group {}", char::from(b'A' + offset)),
        _ => format!("Group {}", index + 1),
    }
}

/// Clear and stage every reference to a deleted `(kind, id)`
fn detach(draft: &mut CacheDraft<'_>, changed: &mut Vec<Entity>, kind: EntityKind, id: EntityId) {
    match kind {
        EntityKind::User => {
            let groups: Vec<Group> = draft
                .get(EntityKind::Group)
                .iter()
                .filter_map(Entity::as_group)
                .filter(|group| group.has_member(id) || group.leader_id == Some(id))
                .cloned()
                .collect();
            for mut group in groups {
                group.remove_member(id);
                stage(draft, changed, group);
            }
        }
        EntityKind::Group => {
            let users: Vec<User> = draft
                .get(EntityKind::User)
                .iter()
                .filter_map(Entity::as_user)
                .filter(|user| user.group_id == Some(id))
                .cloned()
                .collect();
            for mut user in users {
                user.group_id = None;
                user.dynamic_fields.is_leader = false;
                stage(draft, changed, user);
            }
        }
        EntityKind::Field | EntityKind::Setting => {}
    }
}

/// Set members' status to follow the group's flag; inactive users are left
/// alone
fn cascade_flag(draft: &mut CacheDraft<'_>, changed: &mut Vec<Entity>, group: &Group) {
    let status = if group.flagged {
        UserStatus::Flagged
    } else {
        UserStatus::Active
    };
    let members: Vec<User> = draft
        .get(EntityKind::User)
        .iter()
        .filter_map(Entity::as_user)
        .filter(|user| group.has_member(user.id) || user.group_id == Some(group.id))
        .filter(|user| user.status != UserStatus::Inactive && user.status != status)
        .cloned()
        .collect();
    for mut user in members {
        user.status = status;
        stage(draft, changed, user);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::sync::remote::ChangeEvent;
    use crate::sync::testing::{
        context, context_on, record, MemoryStore, RecordingObserver, ScriptedRemote,
    };
    use crate::sync::{ConflictReason, SyncContext};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Harness {
        ctx: Arc<SyncContext>,
        remote: Arc<ScriptedRemote>,
        engine: SyncEngine,
    }

    async fn setup() -> Harness {
        let ctx = context(Arc::new(RecordingObserver::default())).await;
        ctx.set_connected(true);
        let remote = Arc::new(ScriptedRemote::default());
        let engine = SyncEngine::new(ctx.clone(), remote.clone());
        Harness {
            ctx,
            remote,
            engine,
        }
    }

    async fn seed_group(harness: &Harness, capacity: u32, members: &[i64]) -> EntityId {
        let mut group = Group::new("Alpha", capacity);
        group.id = EntityId::new(40);
        let group = harness.engine.create_group(group).await.unwrap();
        for id in members {
            let mut user = User::new(format!("User {id}"), format!("REG{id:03}"));
            user.id = EntityId::new(*id);
            user.group_id = Some(group.id);
            harness.engine.create_user(user).await.unwrap();
        }
        group.id
    }

    fn leaders(harness: &Harness) -> Vec<EntityId> {
        harness
            .ctx
            .cache()
            .users()
            .into_iter()
            .filter(|user| user.dynamic_fields.is_leader)
            .map(|user| user.id)
            .collect()
    }

    #[tokio::test]
    async fn full_group_rejects_new_member() {
        let harness = setup().await;
        let group_id = seed_group(&harness, 1, &[1]).await;
        let mut outsider = User::new("Bo", "REG002");
        outsider.id = EntityId::new(2);
        harness.engine.create_user(outsider).await.unwrap();

        let result = harness.engine.add_member(group_id, EntityId::new(2)).await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        let group = harness.ctx.cache().group(group_id).unwrap();
        assert_eq!(group.members, vec![EntityId::new(1)]);
        assert_eq!(harness.ctx.cache().user(EntityId::new(2)).unwrap().group_id, None);
    }

    #[tokio::test]
    async fn adding_a_member_moves_them_out_of_their_old_group() {
        let harness = setup().await;
        let old_group = seed_group(&harness, 3, &[1]).await;
        harness.engine.set_leader(old_group, Some(EntityId::new(1))).await.unwrap();
        let mut target = Group::new("Beta", 3);
        target.id = EntityId::new(41);
        harness.engine.create_group(target).await.unwrap();

        harness
            .engine
            .add_member(EntityId::new(41), EntityId::new(1))
            .await
            .unwrap();

        let old = harness.ctx.cache().group(old_group).unwrap();
        assert!(old.members.is_empty());
        assert_eq!(old.leader_id, None);
        let user = harness.ctx.cache().user(EntityId::new(1)).unwrap();
        assert_eq!(user.group_id, Some(EntityId::new(41)));
        assert!(!user.dynamic_fields.is_leader);
        assert_eq!(
            harness.ctx.cache().group(EntityId::new(41)).unwrap().members,
            vec![EntityId::new(1)]
        );
    }

    #[tokio::test]
    async fn setting_a_new_leader_demotes_the_old_one() {
        let harness = setup().await;
        let group_id = seed_group(&harness, 3, &[1, 2]).await;
        harness.engine.set_leader(group_id, Some(EntityId::new(1))).await.unwrap();
        assert_eq!(leaders(&harness), vec![EntityId::new(1)]);

        harness.engine.set_leader(group_id, Some(EntityId::new(2))).await.unwrap();

        assert_eq!(leaders(&harness), vec![EntityId::new(2)]);
        assert_eq!(
            harness.ctx.cache().group(group_id).unwrap().leader_id,
            Some(EntityId::new(2))
        );
    }

    #[tokio::test]
    async fn leader_must_be_a_member() {
        let harness = setup().await;
        let group_id = seed_group(&harness, 3, &[1]).await;

        let result = harness.engine.set_leader(group_id, Some(EntityId::new(9))).await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert!(leaders(&harness).is_empty());
    }

    #[tokio::test]
    async fn deleting_a_group_clears_member_references() {
        let harness = setup().await;
        let group_id = seed_group(&harness, 3, &[1, 2]).await;

        harness.engine.delete_group(group_id).await.unwrap();

        assert!(harness.ctx.cache().group(group_id).is_none());
        for id in [1, 2] {
            let user = harness.ctx.cache().user(EntityId::new(id)).unwrap();
            assert_eq!(user.group_id, None);
        }
        assert!(harness.ctx.tombstones().is_deleted(EntityKind::Group, group_id));
        assert_eq!(harness.remote.deletes(), vec![(EntityKind::Group, group_id)]);
        assert!(harness.engine.batcher().is_pending(EntityKind::User, EntityId::new(1)));
    }

    #[tokio::test]
    async fn duplicate_registration_number_is_rejected() {
        let harness = setup().await;
        let mut existing = User::new("Ada", "REG001");
        existing.id = EntityId::new(1);
        harness.engine.create_user(existing).await.unwrap();

        let error = harness
            .engine
            .create_user(User::new("Copy", "reg001"))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            SyncError::Conflict { reason: ConflictReason::Unique, ref field, .. } if field == "registration_number"
        ));
        let matching = harness
            .ctx
            .cache()
            .users()
            .into_iter()
            .filter(|user| user.registration_number.eq_ignore_ascii_case("REG001"))
            .count();
        assert_eq!(matching, 1);
    }

    #[tokio::test]
    async fn deleted_user_never_comes_back() {
        let harness = setup().await;
        let mut user = User::new("Gus", "REG007");
        user.id = EntityId::new(7);
        harness.engine.create_user(user.clone()).await.unwrap();
        harness.remote.seed(
            EntityKind::User,
            json!({"id": 7, "full_name": "Gus", "registration_number": "REG007"}),
        );

        harness.engine.delete_user(EntityId::new(7)).await.unwrap();
        // Remote delete went through, so put the row back as a lagging replica.
        harness.remote.seed(
            EntityKind::User,
            json!({"id": 7, "full_name": "Gus", "registration_number": "REG007"}),
        );

        harness.engine.reconciler().reconcile_all().await;
        harness
            .engine
            .stream()
            .apply(ChangeEvent::insert(
                EntityKind::User,
                EntityId::new(7),
                record(json!({"id": 7, "full_name": "Gus", "registration_number": "REG007"})),
            ))
            .await
            .unwrap();
        harness.ctx.cache().put(user.into()).await.unwrap();

        assert!(!harness.ctx.cache().contains(EntityKind::User, EntityId::new(7)));
        assert!(harness.ctx.tombstones().is_deleted(EntityKind::User, EntityId::new(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_assign_fills_groups_round_robin_in_one_batch() {
        let harness = setup().await;
        for (id, name) in [(40, "Alpha"), (41, "Beta")] {
            let mut group = Group::new(name, 2);
            group.id = EntityId::new(id);
            harness.engine.create_group(group).await.unwrap();
        }
        for id in 1..=5 {
            let mut user = User::new(format!("User {id}"), format!("REG{id:03}"));
            user.id = EntityId::new(id);
            harness.engine.create_user(user).await.unwrap();
        }
        harness.engine.flush().await;
        harness.remote.clear_calls();

        assert_eq!(harness.engine.auto_assign().await.unwrap(), 4);

        let members = |id: i64| harness.ctx.cache().group(EntityId::new(id)).unwrap().members;
        assert_eq!(members(40), vec![EntityId::new(1), EntityId::new(3)]);
        assert_eq!(members(41), vec![EntityId::new(2), EntityId::new(4)]);
        assert_eq!(harness.ctx.cache().user(EntityId::new(5)).unwrap().group_id, None);

        harness.engine.flush().await;
        let user_commits = harness.remote.commits(EntityKind::User);
        assert_eq!(user_commits.len(), 1);
        assert_eq!(user_commits[0].len(), 4);
        assert_eq!(harness.remote.commits(EntityKind::Group).len(), 1);
    }

    #[tokio::test]
    async fn auto_assign_needs_groups() {
        let harness = setup().await;
        harness
            .engine
            .create_user(User::new("Ada", "REG001"))
            .await
            .unwrap();

        assert!(matches!(
            harness.engine.auto_assign().await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn generated_groups_seat_every_user() {
        let harness = setup().await;
        for id in 1..=5 {
            let mut user = User::new(format!("User {id}"), format!("REG{id:03}"));
            user.id = EntityId::new(id);
            harness.engine.create_user(user).await.unwrap();
        }

        let created = harness.engine.generate_groups(2).await.unwrap();

        let names: Vec<&str> = created.iter().map(|group| group.name.as_str()).collect();
        assert_eq!(names, vec!["Group A", "Group B", "Group C"]);
        assert!(created.iter().all(|group| group.id.is_provisional()));
        assert_eq!(harness.ctx.cache().groups().len(), 3);
        assert!(harness.engine.generate_groups(0).await.is_err());
    }

    #[tokio::test]
    async fn failed_local_delete_rolls_back_the_tombstone() {
        let store = Arc::new(MemoryStore::default());
        let ctx = context_on(store.clone(), Arc::new(RecordingObserver::default())).await;
        let engine = SyncEngine::new(ctx.clone(), Arc::new(ScriptedRemote::default()));
        let ada = engine.create_user(User::new("Ada", "REG001")).await.unwrap();
        store.fail_key(EntityKind::User.cache_key());

        let result = engine.delete_user(ada.id).await;

        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert!(ctx.cache().contains(EntityKind::User, ada.id));
        assert!(!ctx.tombstones().is_deleted(EntityKind::User, ada.id));
    }

    #[tokio::test]
    async fn offline_delete_is_deferred_to_reconciliation() {
        let harness = setup().await;
        let mut field = Field::new("Shirt size", "text");
        field.id = EntityId::new(3);
        harness.engine.upsert_field(field).await.unwrap();
        harness.ctx.set_connected(false);

        harness.engine.delete_field(EntityId::new(3)).await.unwrap();

        assert!(harness.remote.deletes().is_empty());
        assert!(harness.ctx.tombstones().is_deleted(EntityKind::Field, EntityId::new(3)));
        harness.engine.flush().await;
        assert!(harness.remote.commits(EntityKind::Field).is_empty());
    }

    #[tokio::test]
    async fn flagging_a_group_cascades_to_members() {
        let harness = setup().await;
        let group_id = seed_group(&harness, 3, &[1, 2, 3]).await;
        let mut inactive = harness.ctx.cache().user(EntityId::new(3)).unwrap();
        inactive.status = UserStatus::Inactive;
        harness.engine.update_user(inactive).await.unwrap();

        harness.engine.set_group_flagged(group_id, true).await.unwrap();

        let status = |id| harness.ctx.cache().user(EntityId::new(id)).unwrap().status;
        assert_eq!(status(1), UserStatus::Flagged);
        assert_eq!(status(2), UserStatus::Flagged);
        assert_eq!(status(3), UserStatus::Inactive);
        assert!(harness.ctx.cache().group(group_id).unwrap().flagged);

        harness.engine.set_group_flagged(group_id, false).await.unwrap();
        assert_eq!(status(1), UserStatus::Active);
    }

    #[tokio::test]
    async fn settings_always_use_the_singleton_row() {
        let harness = setup().await;
        let setting = Setting {
            id: EntityId::new(99),
            enabled: true,
            ..Setting::default()
        };

        let saved = harness.engine.save_setting(setting).await.unwrap();

        assert_eq!(saved.id, SETTINGS_ROW_ID);
        assert!(harness.ctx.cache().setting().unwrap().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_created_group_and_member_sync_with_remote_ids() {
        let harness = setup().await;
        let group = harness.engine.create_group(Group::new("Alpha", 3)).await.unwrap();
        let mut user = User::new("Ada", "REG001");
        user.group_id = Some(group.id);
        let user = harness.engine.create_user(user).await.unwrap();
        assert!(group.id.is_provisional() && user.id.is_provisional());

        tokio::time::sleep(Duration::from_secs(2)).await;

        let users = harness.ctx.cache().users();
        let groups = harness.ctx.cache().groups();
        assert_eq!(users.len(), 1);
        assert_eq!(groups.len(), 1);
        let (user, group) = (&users[0], &groups[0]);
        assert!(!user.id.is_provisional() && !group.id.is_provisional());
        assert_eq!(user.group_id, Some(group.id));
        assert_eq!(group.members, vec![user.id]);

        let remote_groups = harness.remote.rows(EntityKind::Group);
        assert_eq!(remote_groups.len(), 1);
        assert_eq!(remote_groups[0]["members"], json!([user.id.get()]));
        let remote_users = harness.remote.rows(EntityKind::User);
        assert_eq!(remote_users.len(), 1);
        assert_eq!(remote_users[0]["group_id"], json!(group.id.get()));
        assert_eq!(harness.engine.batcher().queued_len(), 0);
    }
}
