//! Remote writes with in-flight tracking and rejection classification.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::remote::RemoteStore;
use super::{SyncContext, SyncError, SyncResult};
use crate::models::{Entity, EntityId, EntityKind};

struct InFlight {
    kind: EntityKind,
    started_at: Instant,
    token: u64,
}

/// Removes its in-flight entry when the operation settles
struct InFlightGuard<'a> {
    resolver: &'a ConflictResolver,
    operation_id: String,
    token: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.resolver.lock();
        if in_flight
            .get(&self.operation_id)
            .is_some_and(|entry| entry.token == self.token)
        {
            in_flight.remove(&self.operation_id);
        }
    }
}

/// Executes remote writes and applies their outcome to the local cache.
///
/// The in-flight map is the only guard against two concurrent commits of the
/// same logical write.
pub struct ConflictResolver {
    ctx: Arc<SyncContext>,
    remote: Arc<dyn RemoteStore>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_token: AtomicU64,
    /// Provisional ids replaced by remote-assigned ones
    rekeyed: Mutex<HashMap<(EntityKind, EntityId), EntityId>>,
}

impl ConflictResolver {
    pub fn new(ctx: Arc<SyncContext>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            ctx,
            remote,
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            rekeyed: Mutex::new(HashMap::new()),
        }
    }

    /// Default operation id: `{table}_{id}_{uuid}`
    #[must_use]
    pub fn operation_id(kind: EntityKind, id: EntityId) -> String {
        format!("{}_{}_{}", kind.table(), id, Uuid::now_v7().simple())
    }

    /// Commit one entity and return its canonical form
    pub async fn commit(&self, entity: Entity, operation_id: Option<String>) -> SyncResult<Entity> {
        let kind = entity.kind();
        let mut canonical = self.commit_batch(kind, vec![entity], operation_id).await?;
        canonical
            .pop()
            .ok_or_else(|| SyncError::Remote(format!("remote returned no {kind} row")))
    }

    /// Bulk upsert entities of one kind.
    ///
    /// Provisional ids are replaced by the remote-assigned ones in the local
    /// cache, together with every reference to them.
    pub async fn commit_batch(
        &self,
        kind: EntityKind,
        entities: Vec<Entity>,
        operation_id: Option<String>,
    ) -> SyncResult<Vec<Entity>> {
        let Some(first) = entities.first() else {
            return Ok(Vec::new());
        };
        self.validate(kind, &entities)?;

        let operation_id = operation_id.unwrap_or_else(|| {
            if entities.len() == 1 {
                Self::operation_id(kind, first.id())
            } else {
                format!("{}_batch{}_{}", kind.table(), entities.len(), Uuid::now_v7().simple())
            }
        });
        let _guard = self.begin(&operation_id, kind)?;

        let records = entities
            .iter()
            .map(Entity::to_remote_record)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(%kind, count = records.len(), %operation_id, "Committing batch");

        let rows = self
            .with_timeout(self.remote.commit_batch(kind, records))
            .await?
            .map_err(|detail| detail.classify())?;
        if rows.len() != entities.len() {
            return Err(SyncError::Remote(format!(
                "remote returned {} rows for {} {kind} writes",
                rows.len(),
                entities.len()
            )));
        }
        let canonical = rows
            .iter()
            .map(|row| Entity::from_record(kind, row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| SyncError::Remote(format!("invalid {kind} row from remote: {error}")))?;

        let orphaned = self
            .ctx
            .cache()
            .transaction(|draft| {
                let mut orphaned = Vec::new();
                for (sent, stored) in entities.iter().zip(&canonical) {
                    if sent.id() != stored.id() {
                        if draft.is_tombstoned(kind, sent.id()) {
                            orphaned.push(stored.id());
                            continue;
                        }
                        draft.rekey(kind, sent.id(), stored.id());
                    }
                    // The local copy moved on while the commit was in flight
                    // (a newer edit or a rewritten reference); keep it.
                    let sent_as_stored = sent.clone().with_id(stored.id());
                    let mut stored = stored.clone();
                    if let Some(current) = draft.find(kind, stored.id()) {
                        if current.updated_at() > sent.updated_at() || *current != sent_as_stored {
                            continue;
                        }
                        stored.restore_provisional_references(current);
                    }
                    draft.upsert(stored);
                }
                Ok(orphaned)
            })
            .await?;

        {
            let mut rekeyed = self.lock_rekeyed();
            for (sent, stored) in entities.iter().zip(&canonical) {
                if sent.id() != stored.id() {
                    rekeyed.insert((kind, sent.id()), stored.id());
                }
            }
        }

        for id in orphaned {
            tracing::info!(%kind, %id, "Entity deleted while its create was in flight");
            self.ctx.tombstones().mark_deleted(kind, id).await?;
            self.delete(kind, id, None).await?;
        }

        Ok(canonical)
    }

    /// Delete an entity remotely. Provisional ids never reached the remote.
    pub async fn delete(
        &self,
        kind: EntityKind,
        id: EntityId,
        operation_id: Option<String>,
    ) -> SyncResult<()> {
        if id.is_provisional() {
            return Ok(());
        }
        let operation_id =
            operation_id.unwrap_or_else(|| format!("delete_{}", Self::operation_id(kind, id)));
        let _guard = self.begin(&operation_id, kind)?;

        self.with_timeout(self.remote.delete(kind, id))
            .await?
            .map_err(|detail| detail.classify())?;
        tracing::debug!(%kind, %id, "Deleted remotely");
        Ok(())
    }

    /// Drop in-flight entries older than the configured horizon
    pub fn evict_stale(&self) -> usize {
        let horizon = self.ctx.settings().in_flight_horizon();
        let mut in_flight = self.lock();
        let before = in_flight.len();
        in_flight.retain(|operation_id, entry| {
            let stale = entry.started_at.elapsed() >= horizon;
            if stale {
                tracing::warn!(%operation_id, kind = %entry.kind, "Evicting stale in-flight operation");
            }
            !stale
        });
        before - in_flight.len()
    }

    /// The remote id a provisional id was replaced by, or `id` itself
    pub fn canonical_id(&self, kind: EntityKind, id: EntityId) -> EntityId {
        if !id.is_provisional() {
            return id;
        }
        self.lock_rekeyed().get(&(kind, id)).copied().unwrap_or(id)
    }

    /// Operation ids currently in flight, sorted
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn validate(&self, kind: EntityKind, entities: &[Entity]) -> SyncResult<()> {
        for entity in entities {
            if entity.kind() != kind {
                return Err(SyncError::Validation(format!(
                    "{} in a {kind} batch",
                    entity.kind()
                )));
            }
            entity.validate().map_err(SyncError::Validation)?;
        }
        if kind == EntityKind::User {
            self.check_unique(entities)?;
        }
        Ok(())
    }

    /// Reject users whose registration number or email is already taken locally
    fn check_unique(&self, entities: &[Entity]) -> SyncResult<()> {
        let cached = self.ctx.cache().users();
        let users: Vec<_> = entities.iter().filter_map(Entity::as_user).collect();

        for (index, user) in users.iter().enumerate() {
            let clash = cached
                .iter()
                .filter(|other| !users.iter().any(|pending| pending.id == other.id))
                .chain(users[..index].iter().copied())
                .find_map(|other| user.unique_key_collision(other));
            if let Some(field) = clash {
                return Err(SyncError::unique(
                    field,
                    format!("{field} already used by another user"),
                ));
            }
        }
        Ok(())
    }

    fn begin(&self, operation_id: &str, kind: EntityKind) -> SyncResult<InFlightGuard<'_>> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut in_flight = self.lock();
        if in_flight.contains_key(operation_id) {
            return Err(SyncError::DuplicateOperation(operation_id.to_string()));
        }
        in_flight.insert(
            operation_id.to_string(),
            InFlight {
                kind,
                started_at: Instant::now(),
                token,
            },
        );
        Ok(InFlightGuard {
            resolver: self,
            operation_id: operation_id.to_string(),
            token,
        })
    }

    async fn with_timeout<T>(&self, call: impl Future<Output = T>) -> SyncResult<T> {
        bounded(self.ctx.settings().remote_timeout(), call).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rekeyed(&self) -> std::sync::MutexGuard<'_, HashMap<(EntityKind, EntityId), EntityId>> {
        self.rekeyed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Await `call`, failing with `Timeout` after `limit`
pub(crate) async fn bounded<T>(limit: Duration, call: impl Future<Output = T>) -> SyncResult<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| SyncError::Timeout(duration_millis(limit)))
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
