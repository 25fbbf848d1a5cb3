//! Coalesces local writes into time-boxed remote batches.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;

use super::{ConflictReason, ConflictResolver, RetryPolicy, Severity, SyncContext, SyncError};
use crate::models::{Entity, EntityId, EntityKind};

#[derive(Debug, Clone)]
struct QueuedWrite {
    entity: Entity,
    /// Failed commit attempts so far
    attempts: u32,
}

#[derive(Default)]
struct Queue {
    pending: BTreeMap<EntityKind, BTreeMap<EntityId, QueuedWrite>>,
    timer_armed: bool,
}

/// Outcome counts of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub committed: usize,
    pub retrying: usize,
    pub parked: usize,
    pub rejected: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: Self) {
        self.committed += other.committed;
        self.retrying += other.retrying;
        self.parked += other.parked;
        self.rejected += other.rejected;
    }
}

/// Last-write-wins queue keyed by `(kind, id)`.
///
/// The first enqueue arms a timer; when it fires the whole queue is drained
/// and committed with one bulk upsert per kind (chunked by the max batch size).
/// Transient failures are re-enqueued with backoff; writes that exhaust their
/// attempts are parked until connectivity returns. Every write stays in the
/// context's outbox until the remote confirms or rejects it.
pub struct WriteBatcher {
    ctx: Arc<SyncContext>,
    resolver: Arc<ConflictResolver>,
    policy: RetryPolicy,
    queue: Mutex<Queue>,
    parked: Mutex<BTreeMap<(EntityKind, EntityId), Entity>>,
}

impl WriteBatcher {
    pub fn new(ctx: Arc<SyncContext>, resolver: Arc<ConflictResolver>) -> Arc<Self> {
        let settings = ctx.settings();
        let policy = RetryPolicy::linear(settings.max_flush_attempts, settings.retry_delay());
        Arc::new(Self {
            ctx,
            resolver,
            policy,
            queue: Mutex::new(Queue::default()),
            parked: Mutex::new(BTreeMap::new()),
        })
    }

    /// Queue `entity`, replacing any queued write for the same `(kind, id)`
    pub fn enqueue(self: &Arc<Self>, entity: Entity) {
        let kind = entity.kind();
        let id = entity.id();
        self.lock_parked().remove(&(kind, id));
        self.ctx.outbox().track(kind, id);

        let arm = {
            let mut queue = self.lock_queue();
            let replaced = queue
                .pending
                .entry(kind)
                .or_default()
                .insert(id, QueuedWrite { entity, attempts: 0 })
                .is_some();
            if replaced {
                tracing::debug!(%kind, %id, "Coalesced queued write");
            }
            !std::mem::replace(&mut queue.timer_armed, true)
        };

        if arm {
            let batcher = Arc::clone(self);
            let window = self.ctx.settings().batch_window();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                batcher.flush().await;
            });
        }
    }

    /// Drain the queue and commit it.
    ///
    /// Writes enqueued while this runs start a fresh batch.
    pub async fn flush(self: &Arc<Self>) -> FlushReport {
        let drained = {
            let mut queue = self.lock_queue();
            queue.timer_armed = false;
            std::mem::take(&mut queue.pending)
        };
        if drained.is_empty() {
            return FlushReport::default();
        }

        let flushes = drained.into_iter().map(|(kind, writes)| async move {
            let (writes, superseded) = self.refresh(kind, writes.into_values());
            self.settle(kind, superseded).await;
            self.flush_kind(kind, writes).await
        });

        let mut report = FlushReport::default();
        for kind_report in join_all(flushes).await {
            report.absorb(kind_report);
        }
        tracing::debug!(?report, "Flushed write queue");
        report
    }

    /// Move parked writes back into the queue and flush them
    pub async fn requeue_parked(self: &Arc<Self>) -> usize {
        let parked = std::mem::take(&mut *self.lock_parked());
        if parked.is_empty() {
            return 0;
        }

        let count = parked.len();
        let requeued = parked
            .into_values()
            .map(|entity| QueuedWrite {
                entity,
                attempts: 0,
            })
            .collect();
        self.insert_if_absent(requeued);
        tracing::info!(count, "Re-enqueued parked writes");
        self.flush().await;
        count
    }

    /// Queue the cached copy of every write left in the outbox, such as edits
    /// made before a restart. Entries whose entity is gone are dropped.
    pub async fn requeue_outbox(self: &Arc<Self>) -> usize {
        let mut requeued = 0;
        let mut stale = Vec::new();
        for pending in self.ctx.outbox().list() {
            let kind = pending.kind;
            if self.is_pending(kind, pending.id) {
                continue;
            }
            let id = self.resolver.canonical_id(kind, pending.id);
            let cached = self.ctx.cache().find(kind, id);
            match cached {
                Some(entity) if !self.ctx.tombstones().is_deleted(kind, id) => {
                    if id != pending.id {
                        stale.push((kind, pending.id));
                    }
                    self.enqueue(entity);
                    requeued += 1;
                }
                _ => stale.push((kind, pending.id)),
            }
        }

        if let Err(error) = self.ctx.outbox().settle(stale).await {
            tracing::warn!(%error, "Failed to update outbox");
        }
        if requeued > 0 {
            tracing::info!(count = requeued, "Re-enqueued unsynced writes");
        }
        requeued
    }

    pub fn is_pending(&self, kind: EntityKind, id: EntityId) -> bool {
        self.lock_queue()
            .pending
            .get(&kind)
            .is_some_and(|writes| writes.contains_key(&id))
    }

    pub fn queued_len(&self) -> usize {
        self.lock_queue().pending.values().map(BTreeMap::len).sum()
    }

    pub fn parked_len(&self) -> usize {
        self.lock_parked().len()
    }

    /// Bring drained writes up to date: follow ids the remote has replaced,
    /// prefer the current cached copy, and drop deleted entities.
    ///
    /// Also returns the ids that no longer need sending under their old key.
    fn refresh(
        &self,
        kind: EntityKind,
        writes: impl IntoIterator<Item = QueuedWrite>,
    ) -> (Vec<QueuedWrite>, Vec<EntityId>) {
        let mut fresh: BTreeMap<EntityId, QueuedWrite> = BTreeMap::new();
        let mut superseded = Vec::new();
        for write in writes {
            let queued_id = write.entity.id();
            let id = self.resolver.canonical_id(kind, queued_id);
            if self.ctx.tombstones().is_deleted(kind, id) {
                tracing::debug!(%kind, %id, "Dropping queued write of deleted entity");
                superseded.push(queued_id);
                continue;
            }
            if id != queued_id {
                self.ctx.outbox().track(kind, id);
                superseded.push(queued_id);
            }
            let entity = self
                .ctx
                .cache()
                .find(kind, id)
                .unwrap_or_else(|| write.entity.with_id(id));
            let attempts = fresh
                .get(&id)
                .map_or(write.attempts, |queued| queued.attempts.min(write.attempts));
            fresh.insert(id, QueuedWrite { entity, attempts });
        }
        (fresh.into_values().collect(), superseded)
    }

    async fn flush_kind(self: &Arc<Self>, kind: EntityKind, writes: Vec<QueuedWrite>) -> FlushReport {
        let mut report = FlushReport::default();
        // Rows without an id cannot share a bulk upsert with rows that have one.
        let (provisional, assigned): (Vec<_>, Vec<_>) = writes
            .into_iter()
            .partition(|write| write.entity.id().is_provisional());
        let batch_size = self.ctx.settings().max_batch_size.max(1);
        for chunk in assigned
            .chunks(batch_size)
            .chain(provisional.chunks(batch_size))
        {
            let entities = chunk.iter().map(|write| write.entity.clone()).collect();
            match self.resolver.commit_batch(kind, entities, None).await {
                Ok(committed) => {
                    report.committed += committed.len();
                    self.confirm(kind, chunk, &committed).await;
                    self.push_rekeyed_references(kind, chunk, &committed);
                }
                Err(error) if error.is_retryable() => {
                    report.absorb(self.retry_later(kind, chunk.to_vec(), &error).await);
                }
                Err(SyncError::Conflict { .. }) if chunk.len() > 1 => {
                    tracing::warn!(%kind, count = chunk.len(), "Batch rejected; committing items one by one");
                    for write in chunk {
                        report.absorb(self.commit_single(kind, write.clone()).await);
                    }
                }
                Err(error) => {
                    for write in chunk {
                        report.absorb(self.reject(write.entity.clone(), &error).await);
                    }
                }
            }
        }
        report
    }

    async fn commit_single(self: &Arc<Self>, kind: EntityKind, write: QueuedWrite) -> FlushReport {
        match self
            .resolver
            .commit_batch(kind, vec![write.entity.clone()], None)
            .await
        {
            Ok(committed) => {
                self.confirm(kind, std::slice::from_ref(&write), &committed)
                    .await;
                self.push_rekeyed_references(kind, std::slice::from_ref(&write), &committed);
                FlushReport {
                    committed: 1,
                    ..FlushReport::default()
                }
            }
            Err(error) if error.is_retryable() => self.retry_later(kind, vec![write], &error).await,
            Err(error) => self.reject(write.entity, &error).await,
        }
    }

    /// Handle a permanent failure. A user pointing at a missing group has the
    /// reference cleared and is queued again; anything else is reported.
    async fn reject(self: &Arc<Self>, entity: Entity, error: &SyncError) -> FlushReport {
        let kind = entity.kind();
        if let (
            SyncError::Conflict {
                reason: ConflictReason::ForeignKey,
                ..
            },
            Entity::User(user),
        ) = (error, &entity)
        {
            if user.group_id.is_some() {
                let id = user.id;
                let repaired = self
                    .ctx
                    .cache()
                    .transaction(|draft| {
                        let Some(mut user) = draft.user(id).cloned() else {
                            return Ok(None);
                        };
                        user.group_id = None;
                        user.dynamic_fields.is_leader = false;
                        let entity = Entity::User(user);
                        draft.upsert(entity.clone());
                        Ok(Some(entity))
                    })
                    .await;
                if let Ok(Some(entity)) = repaired {
                    tracing::info!(%id, "Cleared dangling group reference; retrying");
                    self.enqueue(entity);
                    return FlushReport {
                        retrying: 1,
                        ..FlushReport::default()
                    };
                }
            }
        }

        self.settle(kind, [entity.id()]).await;
        self.ctx.report_error("flush", Some(kind), error).await;
        self.ctx
            .notice(Severity::Error, &format!("Could not sync {kind}: {error}"));
        FlushReport {
            rejected: 1,
            ..FlushReport::default()
        }
    }

    async fn retry_later(
        self: &Arc<Self>,
        kind: EntityKind,
        writes: Vec<QueuedWrite>,
        error: &SyncError,
    ) -> FlushReport {
        let mut retry = Vec::new();
        let mut exhausted = Vec::new();
        for write in writes {
            let attempts = write.attempts + 1;
            if self.policy.allows_retry(attempts) {
                retry.push(QueuedWrite {
                    entity: write.entity,
                    attempts,
                });
            } else {
                exhausted.push(write.entity);
            }
        }

        let report = FlushReport {
            retrying: retry.len(),
            parked: exhausted.len(),
            ..FlushReport::default()
        };

        if !exhausted.is_empty() {
            let count = exhausted.len();
            {
                let mut parked = self.lock_parked();
                for entity in exhausted {
                    parked.insert((entity.kind(), entity.id()), entity);
                }
            }
            self.ctx.report_error("flush", Some(kind), error).await;
            self.ctx.notice(
                Severity::Warning,
                &format!("{count} {kind} change(s) saved locally; sync resumes when the connection returns"),
            );
        }

        if let Some(attempt) = retry.iter().map(|write| write.attempts).max() {
            let delay = self.policy.delay_for(attempt);
            tracing::warn!(
                %kind,
                attempt,
                delay_ms = super::resolver::duration_millis(delay),
                %error,
                "Flush failed; retrying"
            );
            self.schedule_retry(retry, delay);
        }

        report
    }

    /// Drop confirmed writes from the outbox
    async fn confirm(&self, kind: EntityKind, sent: &[QueuedWrite], committed: &[Entity]) {
        let ids = sent
            .iter()
            .map(|write| write.entity.id())
            .chain(committed.iter().map(Entity::id));
        self.settle(kind, ids).await;
    }

    /// Remove ids from the outbox unless a newer write for them is queued
    async fn settle(&self, kind: EntityKind, ids: impl IntoIterator<Item = EntityId>) {
        let settled: Vec<(EntityKind, EntityId)> = ids
            .into_iter()
            .filter(|id| !self.is_pending(kind, *id))
            .map(|id| (kind, id))
            .collect();
        if settled.is_empty() {
            return;
        }
        if let Err(error) = self.ctx.outbox().settle(settled).await {
            tracing::warn!(%kind, %error, "Failed to update outbox");
        }
    }

    /// Queue entities whose references were rewritten from provisional ids
    /// so the remote sees the assigned ids too
    fn push_rekeyed_references(
        self: &Arc<Self>,
        kind: EntityKind,
        sent: &[QueuedWrite],
        committed: &[Entity],
    ) {
        let rekeyed: HashSet<EntityId> = sent
            .iter()
            .zip(committed)
            .filter(|(write, stored)| write.entity.id() != stored.id())
            .map(|(_, stored)| stored.id())
            .collect();
        if rekeyed.is_empty() {
            return;
        }

        let cache = self.ctx.cache();
        let referencing: Vec<Entity> = match kind {
            EntityKind::User => cache
                .groups()
                .into_iter()
                .filter(|group| {
                    group.members.iter().any(|member| rekeyed.contains(member))
                        || group.leader_id.is_some_and(|leader| rekeyed.contains(&leader))
                })
                .map(Entity::from)
                .collect(),
            EntityKind::Group => cache
                .users()
                .into_iter()
                .filter(|user| user.group_id.is_some_and(|group| rekeyed.contains(&group)))
                .map(Entity::from)
                .collect(),
            EntityKind::Field | EntityKind::Setting => Vec::new(),
        };
        for entity in referencing {
            tracing::debug!(kind = %entity.kind(), id = %entity.id(), "Re-pushing rekeyed reference");
            self.enqueue(entity);
        }
    }

    fn schedule_retry(self: &Arc<Self>, writes: Vec<QueuedWrite>, delay: Duration) {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            batcher.insert_if_absent(writes);
            batcher.flush().await;
        });
    }

    /// Queue writes unless a newer write for the same id is already queued
    fn insert_if_absent(&self, writes: Vec<QueuedWrite>) {
        let mut queue = self.lock_queue();
        for write in writes {
            queue
                .pending
                .entry(write.entity.kind())
                .or_default()
                .entry(write.entity.id())
                .or_insert(write);
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_parked(&self) -> std::sync::MutexGuard<'_, BTreeMap<(EntityKind, EntityId), Entity>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
