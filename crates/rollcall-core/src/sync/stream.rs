//! Applies live remote mutations to the local cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use super::resolver::bounded;
use super::remote::{ChangeEvent, ChangeFeed, ChangeOp, RemoteStore};
use super::{RemoteErrorDetail, RemoteReconciler, RetryPolicy, SyncContext, SyncError, SyncResult};
use crate::models::{Entity, EntityKind};

/// One listener task per subscribed kind.
///
/// When a feed reports an error or closes, the kind is reconciled and the
/// feed reopened, so the cache never stays stale waiting for events that
/// will not come.
pub struct ChangeStreamConsumer {
    ctx: Arc<SyncContext>,
    remote: Arc<dyn RemoteStore>,
    reconciler: Arc<RemoteReconciler>,
    policy: RetryPolicy,
    listeners: Mutex<HashMap<EntityKind, JoinHandle<()>>>,
}

impl ChangeStreamConsumer {
    pub fn new(
        ctx: Arc<SyncContext>,
        remote: Arc<dyn RemoteStore>,
        reconciler: Arc<RemoteReconciler>,
    ) -> Arc<Self> {
        let settings = ctx.settings();
        let policy = RetryPolicy::linear(settings.max_reconnect_attempts, settings.retry_delay());
        Arc::new(Self {
            ctx,
            remote,
            reconciler,
            policy,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Open the feed for `kind` and start applying its events.
    ///
    /// Subscribing an already subscribed kind replaces the old listener.
    pub async fn subscribe(self: &Arc<Self>, kind: EntityKind) -> SyncResult<()> {
        let feed = self.open(kind).await?;
        self.spawn_listener(kind, feed);
        tracing::info!(%kind, "Subscribed to remote changes");
        Ok(())
    }

    /// Stop listening to `kind`
    pub async fn unsubscribe(&self, kind: EntityKind) {
        let listener = self.lock().remove(&kind);
        if let Some(listener) = listener {
            listener.abort();
            self.remote.unsubscribe(kind).await;
            tracing::info!(%kind, "Unsubscribed from remote changes");
        }
    }

    pub async fn unsubscribe_all(&self) {
        for kind in EntityKind::ALL {
            self.unsubscribe(kind).await;
        }
    }

    pub fn is_subscribed(&self, kind: EntityKind) -> bool {
        self.lock()
            .get(&kind)
            .is_some_and(|listener| !listener.is_finished())
    }

    /// Apply one event. Returns whether the cache changed.
    ///
    /// Applying the same event twice leaves the cache as applying it once.
    pub async fn apply(&self, event: ChangeEvent) -> SyncResult<bool> {
        let ChangeEvent {
            op, kind, id, record,
        } = event;
        match op {
            ChangeOp::Insert | ChangeOp::Update => {
                if self.ctx.tombstones().is_deleted(kind, id) {
                    tracing::debug!(%kind, %id, ?op, "Ignoring change to deleted entity");
                    return Ok(false);
                }
                let record = record.ok_or_else(|| {
                    SyncError::Validation(format!("{op:?} event for {kind} {id} has no record"))
                })?;
                let mut entity = Entity::from_record(kind, &record)?;
                if entity.id() != id {
                    tracing::debug!(%kind, %id, record_id = %entity.id(), "Event id differs from record id");
                    entity.set_id(id);
                }
                self.ctx.cache().put(entity).await
            }
            ChangeOp::Delete => {
                let marked = self.ctx.tombstones().mark_deleted(kind, id).await?;
                let removed = self
                    .ctx
                    .cache()
                    .transaction(|draft| {
                        let removed = draft.remove(kind, id).is_some();
                        let detached = match kind {
                            EntityKind::User => draft.detach_user(id),
                            EntityKind::Group => draft.detach_group(id),
                            EntityKind::Field | EntityKind::Setting => 0,
                        };
                        Ok(removed || detached > 0)
                    })
                    .await;
                if removed.is_err() && marked {
                    self.ctx.tombstones().roll_back(kind, id).await;
                }
                removed
            }
        }
    }

    async fn open(&self, kind: EntityKind) -> SyncResult<ChangeFeed> {
        bounded(self.ctx.settings().remote_timeout(), self.remote.subscribe(kind))
            .await?
            .map_err(|detail| detail.classify())
    }

    fn spawn_listener(self: &Arc<Self>, kind: EntityKind, feed: ChangeFeed) {
        let consumer = Arc::clone(self);
        let listener = tokio::spawn(async move { consumer.listen(kind, feed).await });
        if let Some(previous) = self.lock().insert(kind, listener) {
            previous.abort();
        }
    }

    async fn listen(&self, kind: EntityKind, mut feed: ChangeFeed) {
        loop {
            match self.drain(kind, &mut feed).await {
                Some(detail) => {
                    tracing::warn!(%kind, %detail, "Change feed failed");
                }
                None => tracing::warn!(%kind, "Change feed closed"),
            }
            feed = self.recover(kind).await;
        }
    }

    /// Apply events until the feed fails or closes
    async fn drain(&self, kind: EntityKind, feed: &mut ChangeFeed) -> Option<RemoteErrorDetail> {
        while let Some(item) = feed.recv().await {
            match item {
                Ok(event) => {
                    let event_kind = event.kind;
                    if let Err(error) = self.apply(event).await {
                        self.ctx.report_error("stream", Some(event_kind), &error).await;
                    }
                }
                Err(detail) => return Some(detail),
            }
        }
        tracing::debug!(%kind, "Feed drained");
        None
    }

    /// Reconcile `kind` and reopen its feed, backing off until it succeeds
    async fn recover(&self, kind: EntityKind) -> ChangeFeed {
        let mut attempt = 1;
        loop {
            if let Err(error) = self.reconciler.reconcile_kind(kind).await {
                self.ctx.report_error("reconcile", Some(kind), &error).await;
            }

            let delay = self.policy.delay_for(attempt.min(self.policy.max_attempts));
            tokio::time::sleep(delay).await;

            match self.open(kind).await {
                Ok(feed) => {
                    tracing::info!(%kind, attempt, "Resubscribed to remote changes");
                    return feed;
                }
                Err(error) => {
                    tracing::warn!(%kind, attempt, %error, "Resubscribe failed");
                    attempt += 1;
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EntityKind, JoinHandle<()>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
