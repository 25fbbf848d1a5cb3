//! Fetch-and-merge of remote state into the local cache.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use super::resolver::bounded;
use super::remote::RemoteStore;
use super::{CacheDraft, ConflictResolver, SyncContext, SyncError, SyncResult};
use crate::models::{Entity, EntityId, EntityKind};

/// Merge outcome for one kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindReconcile {
    pub fetched: usize,
    /// Remote-only entities materialized locally
    pub added: usize,
    /// Entities present on both sides where the local copy was kept
    pub kept_local: usize,
    /// Remote rows ignored because they are tombstoned
    pub suppressed: usize,
    pub deletes_reissued: usize,
    pub tombstones_cleared: usize,
}

/// Outcome of a full reconciliation
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub kinds: BTreeMap<EntityKind, Result<KindReconcile, SyncError>>,
    /// Local entities the remote has never seen
    pub unsynced: Vec<Entity>,
    /// Entities whose references were repaired and need pushing
    pub repaired: Vec<Entity>,
}

impl ReconcileReport {
    pub fn succeeded(&self) -> usize {
        self.kinds.values().filter(|result| result.is_ok()).count()
    }

    pub fn all_failed(&self) -> bool {
        !self.kinds.is_empty() && self.succeeded() == 0
    }

    /// Entities to hand to the write batcher
    pub fn pending_writes(&self) -> impl Iterator<Item = &Entity> {
        let repaired: HashSet<_> = self
            .repaired
            .iter()
            .map(|entity| (entity.kind(), entity.id()))
            .collect();
        self.unsynced
            .iter()
            .filter(move |entity| !repaired.contains(&(entity.kind(), entity.id())))
            .chain(self.repaired.iter())
    }
}

/// Local-wins merge: ids present on both sides keep the local copy,
/// remote-only ids are added unless tombstoned, local-only ids are left for
/// the write batcher.
pub struct RemoteReconciler {
    ctx: Arc<SyncContext>,
    remote: Arc<dyn RemoteStore>,
    resolver: Arc<ConflictResolver>,
}

impl RemoteReconciler {
    pub fn new(
        ctx: Arc<SyncContext>,
        remote: Arc<dyn RemoteStore>,
        resolver: Arc<ConflictResolver>,
    ) -> Self {
        Self {
            ctx,
            remote,
            resolver,
        }
    }

    /// Reconcile every kind; a failing kind does not stop the others
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for kind in EntityKind::ALL {
            match self.reconcile_kind(kind).await {
                Ok((outcome, unsynced)) => {
                    report.unsynced.extend(unsynced);
                    report.kinds.insert(kind, Ok(outcome));
                }
                Err(error) => {
                    self.ctx.report_error("reconcile", Some(kind), &error).await;
                    report.kinds.insert(kind, Err(error));
                }
            }
        }

        let users_complete = matches!(report.kinds.get(&EntityKind::User), Some(Ok(_)));
        let groups_complete = matches!(report.kinds.get(&EntityKind::Group), Some(Ok(_)));
        match self.repair_references(users_complete, groups_complete).await {
            Ok(repaired) => report.repaired = repaired,
            Err(error) => self.ctx.report_error("repair", None, &error).await,
        }

        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.kinds.len() - report.succeeded(),
            unsynced = report.unsynced.len(),
            repaired = report.repaired.len(),
            "Reconciled with remote"
        );
        report
    }

    /// Fetch one kind and merge it; returns the merge counts and the local
    /// entities the remote does not have
    pub async fn reconcile_kind(&self, kind: EntityKind) -> SyncResult<(KindReconcile, Vec<Entity>)> {
        let rows = bounded(self.ctx.settings().remote_timeout(), self.remote.fetch_all(kind))
            .await?
            .map_err(|detail| detail.classify())?;

        let mut outcome = KindReconcile {
            fetched: rows.len(),
            ..KindReconcile::default()
        };
        let mut remote_entities = Vec::with_capacity(rows.len());
        for row in &rows {
            match Entity::from_record(kind, row) {
                Ok(entity) => remote_entities.push(entity),
                Err(error) => tracing::warn!(%kind, %error, "Skipping unreadable remote row"),
            }
        }
        let remote_ids: HashSet<EntityId> = remote_entities.iter().map(Entity::id).collect();

        self.settle_tombstones(kind, &remote_ids, &mut outcome).await;

        let unsynced = self
            .ctx
            .cache()
            .transaction(|draft| Ok(merge(draft, kind, remote_entities, &remote_ids, &mut outcome)))
            .await?;

        tracing::debug!(%kind, ?outcome, unsynced = unsynced.len(), "Merged remote rows");
        Ok((outcome, unsynced))
    }

    /// Re-issue deletes the remote missed and drop tombstones the remote has
    /// confirmed
    async fn settle_tombstones(
        &self,
        kind: EntityKind,
        remote_ids: &HashSet<EntityId>,
        outcome: &mut KindReconcile,
    ) {
        for id in self.ctx.tombstones().ids(kind) {
            if remote_ids.contains(&id) {
                match self.resolver.delete(kind, id, None).await {
                    Ok(()) => outcome.deletes_reissued += 1,
                    Err(error) => self.ctx.report_error("delete", Some(kind), &error).await,
                }
            } else if !id.is_provisional() {
                match self.ctx.tombstones().clear(kind, id).await {
                    Ok(_) => outcome.tombstones_cleared += 1,
                    Err(error) => tracing::warn!(%kind, %id, %error, "Failed to clear tombstone"),
                }
            }
        }
    }

    /// Clear dangling group references, stale members, and leader flags that
    /// disagree with their group. Returns the entities that changed.
    async fn repair_references(
        &self,
        users_complete: bool,
        groups_complete: bool,
    ) -> SyncResult<Vec<Entity>> {
        self.ctx
            .cache()
            .transaction(|draft| Ok(repair(draft, users_complete, groups_complete)))
            .await
    }
}

fn merge(
    draft: &mut CacheDraft<'_>,
    kind: EntityKind,
    remote_entities: Vec<Entity>,
    remote_ids: &HashSet<EntityId>,
    outcome: &mut KindReconcile,
) -> Vec<Entity> {
    for entity in remote_entities {
        let id = entity.id();
        if draft.is_tombstoned(kind, id) {
            outcome.suppressed += 1;
        } else if draft.contains(kind, id) {
            outcome.kept_local += 1;
        } else if draft.upsert(entity) {
            outcome.added += 1;
        }
    }

    draft
        .get(kind)
        .iter()
        .filter(|entity| !remote_ids.contains(&entity.id()))
        .cloned()
        .collect()
}

fn repair(draft: &mut CacheDraft<'_>, users_complete: bool, groups_complete: bool) -> Vec<Entity> {
    let group_ids: HashSet<EntityId> = draft.get(EntityKind::Group).iter().map(Entity::id).collect();
    let user_ids: HashSet<EntityId> = draft.get(EntityKind::User).iter().map(Entity::id).collect();
    let mut changed_users = BTreeSet::new();
    let mut changed_groups = BTreeSet::new();

    if groups_complete {
        draft.update_users(|user| match user.group_id {
            Some(group_id) if !group_ids.contains(&group_id) => {
                user.group_id = None;
                user.dynamic_fields.is_leader = false;
                changed_users.insert(user.id);
                true
            }
            _ => false,
        });
    }

    // Members are only dropped as unknown when the user list is complete.
    let deleted: HashSet<EntityId> = draft
        .get(EntityKind::Group)
        .iter()
        .filter_map(Entity::as_group)
        .flat_map(|group| group.members.iter().copied())
        .filter(|member| draft.is_tombstoned(EntityKind::User, *member))
        .collect();
    draft.update_groups(|group| {
        let before = group.members.clone();
        let leader = group.leader_id;
        let mut seen = HashSet::new();
        group.members.retain(|member| {
            !deleted.contains(member)
                && (!users_complete || user_ids.contains(member))
                && seen.insert(*member)
        });
        if group.leader_id.is_some_and(|leader| !group.has_member(leader)) {
            group.leader_id = None;
        }
        let changed = group.members != before || group.leader_id != leader;
        if changed {
            changed_groups.insert(group.id);
        }
        changed
    });

    let leaders: BTreeMap<EntityId, Option<EntityId>> = draft
        .get(EntityKind::Group)
        .iter()
        .filter_map(Entity::as_group)
        .map(|group| (group.id, group.leader_id))
        .collect();
    draft.update_users(|user| {
        if !user.dynamic_fields.is_leader {
            return false;
        }
        let holds_slot = match user.group_id.map(|group_id| leaders.get(&group_id)) {
            Some(Some(leader)) => *leader == Some(user.id),
            Some(None) => !groups_complete,
            None => false,
        };
        if holds_slot {
            return false;
        }
        user.dynamic_fields.is_leader = false;
        changed_users.insert(user.id);
        true
    });

    let repaired: Vec<Entity> = changed_groups
        .into_iter()
        .filter_map(|id| draft.find(EntityKind::Group, id).cloned())
        .chain(
            changed_users
                .into_iter()
                .filter_map(|id| draft.find(EntityKind::User, id).cloned()),
        )
        .collect();
    if !repaired.is_empty() {
        tracing::info!(count = repaired.len(), "Repaired dangling references");
    }
    repaired
}
