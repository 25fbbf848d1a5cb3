//! Durable writes with memory-only fallback.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{Severity, SyncError, SyncObserver, SyncResult};
use crate::services::SnapshotStore;

/// Shared gateway to the snapshot store.
///
/// The first failed write is reported to its caller and switches the process
/// into memory-only mode; while in that mode further failures are swallowed
/// so the affected components keep working from memory. Values swallowed
/// that way are held back and written along with the next successful write,
/// which leaves memory-only mode.
pub(crate) struct Persistence {
    store: Arc<dyn SnapshotStore>,
    observer: Arc<dyn SyncObserver>,
    memory_only: AtomicBool,
    unwritten: Mutex<BTreeMap<String, String>>,
}

impl Persistence {
    pub(crate) fn new(store: Arc<dyn SnapshotStore>, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            store,
            observer,
            memory_only: AtomicBool::new(false),
            unwritten: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn is_memory_only(&self) -> bool {
        self.memory_only.load(Ordering::SeqCst)
    }

    /// Read a stored value; failures are logged and read as absent
    pub(crate) async fn load(&self, key: &str) -> Option<String> {
        match self.store.load(key).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key, %error, "Failed to read local snapshot");
                None
            }
        }
    }

    pub(crate) async fn save(&self, key: &str, value: String) -> SyncResult<()> {
        self.save_many(vec![(key.to_string(), value)]).await
    }

    pub(crate) async fn save_many(&self, entries: Vec<(String, String)>) -> SyncResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // Later values for a key replace anything held back for it.
        let carried = std::mem::take(&mut *self.unwritten());
        let mut batch = carried.clone();
        batch.extend(entries);
        let batch: Vec<(String, String)> = batch.into_iter().collect();

        match self.store.save_many(&batch).await {
            Ok(()) => {
                if self.memory_only.swap(false, Ordering::SeqCst) {
                    tracing::info!(
                        recovered = carried.len(),
                        "Local storage recovered"
                    );
                    self.observer
                        .on_notice(Severity::Success, "Local storage recovered");
                }
                Ok(())
            }
            Err(error) => {
                if self.memory_only.swap(true, Ordering::SeqCst) {
                    tracing::debug!(%error, "Snapshot write skipped in memory-only mode");
                    self.hold_back(batch);
                    Ok(())
                } else {
                    // The caller discards its change, so only earlier values stay pending.
                    self.hold_back(carried);
                    tracing::warn!(%error, "Local storage failed; continuing in memory-only mode");
                    self.observer.on_notice(
                        Severity::Warning,
                        "Local storage unavailable; changes are kept in memory only",
                    );
                    Err(SyncError::Storage(error.to_string()))
                }
            }
        }
    }

    /// Keys whose latest value has not reached the store yet
    #[cfg(test)]
    pub(crate) fn unwritten_keys(&self) -> Vec<String> {
        self.unwritten().keys().cloned().collect()
    }

    fn hold_back(&self, entries: impl IntoIterator<Item = (String, String)>) {
        let mut unwritten = self.unwritten();
        for (key, value) in entries {
            unwritten.entry(key).or_insert(value);
        }
    }

    fn unwritten(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.unwritten.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
