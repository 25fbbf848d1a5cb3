//! Shared cross-platform state types.

use crate::sync::SyncStatus;

/// Coarse sync state shown by every client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    /// Summarize an engine status snapshot
    #[must_use]
    pub fn from_status(status: &SyncStatus) -> Self {
        if !status.connected {
            Self::Offline
        } else if status.parked > 0 {
            Self::Error
        } else if status.queued > 0 || status.unsynced > 0 || !status.in_flight.is_empty() {
            Self::Syncing
        } else {
            Self::Synced
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.label())
    }
}
