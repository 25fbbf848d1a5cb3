//! Bounded log of sync failures, persisted for later inspection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::persist::Persistence;
use super::{ErrorKind, SyncResult};
use crate::models::{now_millis, EntityKind};

pub(crate) const DIAGNOSTICS_KEY: &str = "diagnostics";

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub operation: String,
    #[serde(default)]
    pub kind: Option<EntityKind>,
    pub error_kind: ErrorKind,
    pub message: String,
    pub connected: bool,
    #[serde(default)]
    pub retry_count: u32,
}

impl DiagnosticEntry {
    pub fn new(
        operation: impl Into<String>,
        kind: Option<EntityKind>,
        error_kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: now_millis(),
            operation: operation.into(),
            kind,
            error_kind,
            message: message.into(),
            connected: false,
            retry_count: 0,
        }
    }
}

/// Ring buffer keeping the most recent entries
pub struct DiagnosticLog {
    entries: Mutex<VecDeque<DiagnosticEntry>>,
    capacity: usize,
    persistence: Arc<Persistence>,
    write_lock: tokio::sync::Mutex<()>,
}

impl DiagnosticLog {
    pub(crate) async fn load(persistence: Arc<Persistence>, capacity: usize) -> Self {
        let mut entries: VecDeque<DiagnosticEntry> = match persistence.load(DIAGNOSTICS_KEY).await
        {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                tracing::warn!(%error, "Discarding unreadable diagnostic log");
                VecDeque::new()
            }),
            None => VecDeque::new(),
        };
        while entries.len() > capacity {
            entries.pop_front();
        }

        Self {
            entries: Mutex::new(entries),
            capacity,
            persistence,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Append an entry, evicting the oldest when full.
    ///
    /// Persistence is best effort; the entry stays in memory either way.
    pub async fn record(&self, entry: DiagnosticEntry) {
        let _guard = self.write_lock.lock().await;
        {
            let mut entries = self.lock();
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
        if let Err(error) = self.persist().await {
            tracing::debug!(%error, "Diagnostic log kept in memory only");
        }
    }

    /// Entries, oldest first
    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub async fn clear(&self) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        self.lock().clear();
        self.persist().await
    }

    async fn persist(&self) -> SyncResult<()> {
        let payload = serde_json::to_string(&self.entries())?;
        self.persistence.save(DIAGNOSTICS_KEY, payload).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DiagnosticEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
