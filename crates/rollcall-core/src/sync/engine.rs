//! Wires the sync components around one context.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::remote::RemoteStore;
use super::{
    ChangeStreamConsumer, ConflictResolver, FlushReport, HealthMonitor, LocalCache,
    ReconcileReport, RemoteReconciler, SyncContext, WriteBatcher,
};
use crate::models::EntityKind;

/// Point-in-time view of the sync core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub connected: bool,
    pub retry_count: u32,
    pub in_flight: Vec<String>,
    pub queued: usize,
    pub parked: usize,
    pub unsynced: usize,
    pub tombstones: usize,
    pub memory_only: bool,
    pub subscribed: Vec<EntityKind>,
}

/// The assembled sync core.
///
/// `new` only wires components; `start` also reconciles, opens change feeds
/// and launches the health and stale-sweep loops.
pub struct SyncEngine {
    pub(crate) ctx: Arc<SyncContext>,
    remote: Arc<dyn RemoteStore>,
    pub(crate) resolver: Arc<ConflictResolver>,
    pub(crate) batcher: Arc<WriteBatcher>,
    reconciler: Arc<RemoteReconciler>,
    stream: Arc<ChangeStreamConsumer>,
    health: Arc<HealthMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(ctx: Arc<SyncContext>, remote: Arc<dyn RemoteStore>) -> Self {
        let resolver = Arc::new(ConflictResolver::new(ctx.clone(), remote.clone()));
        let batcher = WriteBatcher::new(ctx.clone(), resolver.clone());
        let reconciler = Arc::new(RemoteReconciler::new(
            ctx.clone(),
            remote.clone(),
            resolver.clone(),
        ));
        let stream = ChangeStreamConsumer::new(ctx.clone(), remote.clone(), reconciler.clone());
        let health = HealthMonitor::new(
            ctx.clone(),
            remote.clone(),
            reconciler.clone(),
            batcher.clone(),
        );
        Self {
            ctx,
            remote,
            resolver,
            batcher,
            reconciler,
            stream,
            health,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wire the components and boot them
    pub async fn start(ctx: Arc<SyncContext>, remote: Arc<dyn RemoteStore>) -> Self {
        let engine = Self::new(ctx, remote);
        engine.boot().await;
        engine
    }

    /// Reconcile, subscribe every kind, then start the background loops
    pub async fn boot(&self) -> ReconcileReport {
        let report = self.reconcile().await;

        if self.remote.supports_change_feed() {
            for kind in EntityKind::ALL {
                if let Err(error) = self.stream.subscribe(kind).await {
                    self.ctx.report_error("subscribe", Some(kind), &error).await;
                }
            }
        } else {
            tracing::info!("Remote has no change feed; relying on reconciliation");
        }

        let health = self.health.spawn();
        let sweep = self.spawn_stale_sweep();
        self.lock_tasks().extend([health, sweep]);
        tracing::info!(connected = self.ctx.is_connected(), "Sync engine started");
        report
    }

    /// Run a full reconciliation and queue everything the remote lacks,
    /// along with writes left in the outbox by an earlier run.
    ///
    /// The connectivity flag follows the outcome: connected unless every
    /// kind failed.
    pub async fn reconcile(&self) -> ReconcileReport {
        let report = self.reconciler.reconcile_all().await;
        self.ctx.set_connected(!report.all_failed());
        for entity in report.pending_writes() {
            self.batcher.enqueue(entity.clone());
        }
        if self.ctx.is_connected() {
            self.batcher.requeue_outbox().await;
        }
        report
    }

    /// Commit queued writes now instead of waiting for the batch window
    pub async fn flush(&self) -> FlushReport {
        self.batcher.flush().await
    }

    /// Stop background work and push what is still queued
    pub async fn shutdown(&self) -> FlushReport {
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            task.abort();
        }
        self.stream.unsubscribe_all().await;
        let report = self.batcher.flush().await;
        tracing::info!(?report, "Sync engine stopped");
        report
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            connected: self.ctx.is_connected(),
            retry_count: self.ctx.retry_count(),
            in_flight: self.resolver.in_flight(),
            queued: self.batcher.queued_len(),
            parked: self.batcher.parked_len(),
            unsynced: self.ctx.outbox().len(),
            tombstones: self.ctx.tombstones().len(),
            memory_only: self.ctx.cache().is_memory_only(),
            subscribed: EntityKind::ALL
                .into_iter()
                .filter(|kind| self.stream.is_subscribed(*kind))
                .collect(),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn cache(&self) -> &LocalCache {
        self.ctx.cache()
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn batcher(&self) -> &Arc<WriteBatcher> {
        &self.batcher
    }

    pub fn reconciler(&self) -> &Arc<RemoteReconciler> {
        &self.reconciler
    }

    pub fn stream(&self) -> &Arc<ChangeStreamConsumer> {
        &self.stream
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    fn spawn_stale_sweep(&self) -> JoinHandle<()> {
        let resolver = self.resolver.clone();
        let period = self.ctx.settings().stale_sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = resolver.evict_stale();
                if evicted > 0 {
                    tracing::info!(evicted, "Evicted stale in-flight operations");
                }
            }
        })
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.lock_tasks().iter() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SyncSettings;
    use crate::models::{EntityId, User};
    use crate::sync::remote::ChangeEvent;
    use crate::sync::testing::{context, record, MemoryStore, RecordingObserver, ScriptedRemote};
    use crate::sync::RemoteErrorDetail;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn start_reconciles_subscribes_and_connects() {
        let observer = Arc::new(RecordingObserver::default());
        let ctx = context(observer.clone()).await;
        let remote = Arc::new(ScriptedRemote::default());
        remote.seed(
            EntityKind::User,
            json!({"id": 1, "full_name": "Ada", "registration_number": "REG001"}),
        );

        let engine = SyncEngine::start(ctx.clone(), remote.clone()).await;

        assert!(ctx.is_connected());
        assert_eq!(observer.connectivity(), vec![true]);
        assert!(ctx.cache().contains(EntityKind::User, EntityId::new(1)));
        let status = engine.status();
        assert_eq!(status.subscribed, EntityKind::ALL.to_vec());
        assert_eq!(status.queued, 0);

        remote
            .emit(
                EntityKind::User,
                Ok(ChangeEvent::insert(
                    EntityKind::User,
                    EntityId::new(2),
                    record(json!({"id": 2, "full_name": "Bo", "registration_number": "REG002"})),
                )),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(ctx.cache().contains(EntityKind::User, EntityId::new(2)));

        engine.shutdown().await;
        assert!(engine.status().subscribed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn boot_with_unreachable_remote_stays_offline() {
        let observer = Arc::new(RecordingObserver::default());
        let ctx = context(observer.clone()).await;
        let remote = Arc::new(ScriptedRemote::default());
        for kind in EntityKind::ALL {
            remote.fail_fetch(kind, RemoteErrorDetail::new("connection refused"));
        }
        remote.disable_change_feed();

        let engine = SyncEngine::start(ctx.clone(), remote.clone()).await;

        assert!(!ctx.is_connected());
        assert!(observer.connectivity().is_empty());
        assert!(engine.status().subscribed.is_empty());
        assert_eq!(ctx.diagnostics().len(), EntityKind::ALL.len());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unsynced_local_entities_are_pushed_after_boot() {
        let ctx = context(Arc::new(RecordingObserver::default())).await;
        let user = User::new("Ada", "REG001");
        ctx.cache().put(user.into()).await.unwrap();
        let remote = Arc::new(ScriptedRemote::default());
        remote.disable_change_feed();

        let engine = SyncEngine::start(ctx.clone(), remote.clone()).await;
        assert_eq!(engine.status().queued, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(remote.commits(EntityKind::User).len(), 1);
        assert_eq!(remote.rows(EntityKind::User).len(), 1);
        assert_eq!(engine.status().queued, 0);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_edit_of_synced_user_is_pushed_after_restart() {
        let store = Arc::new(MemoryStore::default());
        let remote = Arc::new(ScriptedRemote::default());
        remote.disable_change_feed();
        remote.seed(
            EntityKind::User,
            json!({"id": 5, "full_name": "Old", "registration_number": "REG005"}),
        );

        {
            let ctx = SyncContext::open(
                store.clone(),
                Arc::new(RecordingObserver::default()),
                SyncSettings::default(),
            )
            .await;
            let mut user = User::new("Old", "REG005");
            user.id = EntityId::new(5);
            ctx.cache().put(user.clone().into()).await.unwrap();

            // The first run never reaches the remote.
            let unreachable = Arc::new(ScriptedRemote::default());
            unreachable.fail_next_commits(10, &RemoteErrorDetail::new("connection refused"));
            let engine = SyncEngine::new(ctx.clone(), unreachable);
            user.name = "New".to_string();
            engine.update_user(user).await.unwrap();
            assert_eq!(engine.status().unsynced, 1);
        }

        let ctx = SyncContext::open(
            store,
            Arc::new(RecordingObserver::default()),
            SyncSettings::default(),
        )
        .await;
        assert!(ctx.outbox().contains(EntityKind::User, EntityId::new(5)));
        let engine = SyncEngine::new(ctx.clone(), remote.clone());

        engine.reconcile().await;
        assert_eq!(ctx.cache().user(EntityId::new(5)).unwrap().name, "New");
        let report = engine.shutdown().await;

        assert_eq!(report.committed, 1);
        assert_eq!(remote.rows(EntityKind::User)[0]["full_name"], "New");
        assert!(ctx.outbox().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_commit_releases_its_operation_id() {
        let ctx = context(Arc::new(RecordingObserver::default())).await;
        let remote = Arc::new(ScriptedRemote::default());
        remote.disable_change_feed();
        remote.set_commit_delay(Duration::from_secs(3_600));
        let engine = SyncEngine::start(ctx.clone(), remote.clone()).await;

        let resolver = engine.resolver().clone();
        let user: crate::models::Entity = User::new("Ada", "REG001").into();
        let pending = tokio::spawn(async move { resolver.commit(user, Some("stuck".to_string())).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(engine.status().in_flight, vec!["stuck".to_string()]);

        // Remote timeout fires first and releases the entry.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(pending.await.unwrap().is_err());
        assert!(engine.status().in_flight.is_empty());
        engine.shutdown().await;
    }
}
