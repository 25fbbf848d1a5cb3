//! Shared state owned by one sync core instance.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::diagnostics::DiagnosticEntry;
use super::observer::ChangeNotifier;
use super::persist::Persistence;
use super::{
    DiagnosticLog, LocalCache, Outbox, Severity, SyncError, SyncObserver, TombstoneSet,
};
use crate::config::SyncSettings;
use crate::models::EntityKind;
use crate::services::SnapshotStore;

/// Local cache, tombstones, diagnostics and connectivity for one instance.
///
/// Components receive an `Arc<SyncContext>`; nothing is process-global, so
/// independent instances can run side by side.
pub struct SyncContext {
    settings: SyncSettings,
    cache: LocalCache,
    tombstones: Arc<TombstoneSet>,
    outbox: Outbox,
    diagnostics: DiagnosticLog,
    observer: Arc<dyn SyncObserver>,
    connected: AtomicBool,
    retry_count: AtomicU32,
}

impl SyncContext {
    /// Load persisted state from `store`.
    ///
    /// Starts disconnected; the engine or health monitor flips the flag once
    /// the remote answers.
    pub async fn open(
        store: Arc<dyn SnapshotStore>,
        observer: Arc<dyn SyncObserver>,
        settings: SyncSettings,
    ) -> Arc<Self> {
        let persistence = Arc::new(Persistence::new(store, observer.clone()));
        let tombstones = Arc::new(TombstoneSet::load(persistence.clone()).await);
        let cache = LocalCache::load(
            persistence.clone(),
            tombstones.clone(),
            ChangeNotifier::new(observer.clone()),
        )
        .await;
        let outbox = Outbox::load(persistence.clone()).await;
        let diagnostics = DiagnosticLog::load(persistence, settings.diagnostic_capacity).await;

        tracing::info!(
            users = cache.len(EntityKind::User),
            groups = cache.len(EntityKind::Group),
            tombstones = tombstones.len(),
            unsynced = outbox.len(),
            "Loaded local sync state"
        );

        Arc::new(Self {
            settings,
            cache,
            tombstones,
            outbox,
            diagnostics,
            observer,
            connected: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
        })
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub const fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn tombstones(&self) -> &TombstoneSet {
        &self.tombstones
    }

    /// Writes not yet confirmed by the remote
    pub const fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub const fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn observer(&self) -> &dyn SyncObserver {
        self.observer.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Set the connectivity flag; observers hear only real transitions.
    ///
    /// Returns whether the flag changed.
    pub fn set_connected(&self, connected: bool) -> bool {
        let previous = self.connected.swap(connected, Ordering::SeqCst);
        if previous == connected {
            return false;
        }
        tracing::info!(connected, "Connectivity changed");
        self.observer.on_connectivity_changed(connected);
        true
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_retry_count(&self, count: u32) {
        self.retry_count.store(count, Ordering::SeqCst);
    }

    pub fn notice(&self, severity: Severity, message: &str) {
        self.observer.on_notice(severity, message);
    }

    /// Log, record and publish a background failure
    pub async fn report_error(
        &self,
        operation: &str,
        kind: Option<EntityKind>,
        error: &SyncError,
    ) {
        let detail = error.to_string();
        tracing::warn!(operation, kind = ?kind, error_kind = %error.kind(), %detail, "Sync step failed");

        let mut entry = DiagnosticEntry::new(operation, kind, error.kind(), detail.as_str());
        entry.connected = self.is_connected();
        entry.retry_count = self.retry_count();
        self.diagnostics.record(entry).await;

        self.observer.on_sync_error(kind, error.kind(), &detail);
    }
}
