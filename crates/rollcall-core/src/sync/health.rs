//! Periodic reachability probe driving the connectivity flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::resolver::bounded;
use super::remote::RemoteStore;
use super::{RemoteReconciler, RetryPolicy, Severity, SyncContext, SyncError, SyncResult, WriteBatcher};

/// Result of one health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Reachable and already connected
    Healthy,
    /// Reachable again after being disconnected
    Restored,
    /// Unreachable after every reconnect attempt
    Offline,
}

/// Probes the remote on a fixed interval.
///
/// A failed probe flips the context offline and runs a bounded burst of
/// reconnect attempts. Once they are exhausted the monitor stays in local-only
/// mode but keeps probing at the normal interval. Recovery reconciles every
/// kind and pushes whatever was written while offline.
pub struct HealthMonitor {
    ctx: Arc<SyncContext>,
    remote: Arc<dyn RemoteStore>,
    reconciler: Arc<RemoteReconciler>,
    batcher: Arc<WriteBatcher>,
    policy: RetryPolicy,
    degraded: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        ctx: Arc<SyncContext>,
        remote: Arc<dyn RemoteStore>,
        reconciler: Arc<RemoteReconciler>,
        batcher: Arc<WriteBatcher>,
    ) -> Arc<Self> {
        let settings = ctx.settings();
        let policy = RetryPolicy::linear(settings.max_reconnect_attempts, settings.retry_delay());
        Arc::new(Self {
            ctx,
            remote,
            reconciler,
            batcher,
            policy,
            degraded: AtomicBool::new(false),
        })
    }

    /// Whether reconnect attempts were exhausted and the core is local-only
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Start the probe loop on the runtime
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    /// Probe forever at the configured interval
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.ctx.settings().health_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the engine has just reconciled.
        interval.tick().await;
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// Run one health check
    pub async fn tick(&self) -> HealthOutcome {
        match self.probe().await {
            Ok(()) => {
                if self.ctx.set_connected(true) {
                    self.restore().await;
                    HealthOutcome::Restored
                } else {
                    HealthOutcome::Healthy
                }
            }
            Err(error) if self.is_degraded() => {
                tracing::debug!(%error, "Remote still unreachable");
                HealthOutcome::Offline
            }
            Err(error) => self.reconnect(&error).await,
        }
    }

    async fn reconnect(&self, error: &SyncError) -> HealthOutcome {
        if self.ctx.set_connected(false) {
            tracing::warn!(%error, "Remote unreachable");
            self.ctx
                .notice(Severity::Warning, "Connection lost; changes are kept locally");
        }

        let attempt_result = self
            .policy
            .run(
                |attempt| {
                    self.ctx.set_retry_count(attempt);
                    tracing::debug!(attempt, "Reconnect attempt");
                    self.probe()
                },
                SyncError::is_retryable,
            )
            .await;

        match attempt_result {
            Ok(()) => {
                self.ctx.set_connected(true);
                self.restore().await;
                HealthOutcome::Restored
            }
            Err(error) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    self.ctx.report_error("reconnect", None, &error).await;
                    self.ctx.notice(
                        Severity::Warning,
                        "Working in offline mode; sync resumes when the connection returns",
                    );
                }
                HealthOutcome::Offline
            }
        }
    }

    /// Catch up after connectivity returns
    async fn restore(&self) {
        self.ctx.set_retry_count(0);
        self.degraded.store(false, Ordering::SeqCst);
        self.ctx.notice(Severity::Success, "Connection restored");

        let report = self.reconciler.reconcile_all().await;
        for entity in report.pending_writes() {
            self.batcher.enqueue(entity.clone());
        }
        self.batcher.requeue_outbox().await;
        let requeued = self.batcher.requeue_parked().await;
        tracing::info!(
            reconciled = report.succeeded(),
            requeued,
            "Caught up after reconnect"
        );
    }

    async fn probe(&self) -> SyncResult<()> {
        bounded(self.ctx.settings().probe_timeout(), self.remote.probe())
            .await?
            .map_err(|detail| detail.classify())
    }
}
