//! Notification interface for collaborators of the sync core.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::ErrorKind;
use crate::models::EntityKind;

/// Presentation class of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Warning,
    Error,
}

/// Callbacks fired by the sync core. Every method defaults to a no-op.
///
/// Implementations must return quickly; they are called from sync tasks.
pub trait SyncObserver: Send + Sync {
    /// Local cache contents for `kind` changed
    fn on_cache_changed(&self, _kind: EntityKind) {}

    fn on_connectivity_changed(&self, _connected: bool) {}

    /// A background sync step failed; never raised to callers as a hard error
    fn on_sync_error(&self, _kind: Option<EntityKind>, _error: ErrorKind, _detail: &str) {}

    /// Short-lived message for a toast or status line
    fn on_notice(&self, _severity: Severity, _message: &str) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// Coalesces cache-changed notifications so each kind fires at most once per tick.
#[derive(Clone)]
pub(crate) struct ChangeNotifier {
    observer: Arc<dyn SyncObserver>,
    pending: Arc<Mutex<BTreeSet<EntityKind>>>,
}

impl ChangeNotifier {
    pub(crate) fn new(observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            observer,
            pending: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub(crate) fn notify(&self, kind: EntityKind) {
        let schedule = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let was_idle = pending.is_empty();
            pending.insert(kind);
            was_idle
        };
        if !schedule {
            return;
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let notifier = self.clone();
            handle.spawn(async move {
                tokio::task::yield_now().await;
                notifier.flush();
            });
        } else {
            self.flush();
        }
    }

    /// Deliver pending notifications now
    pub(crate) fn flush(&self) {
        let kinds = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for kind in kinds {
            self.observer.on_cache_changed(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::RecordingObserver;

    #[tokio::test]
    async fn notifications_coalesce_within_a_tick() {
        let observer = Arc::new(RecordingObserver::default());
        let notifier = ChangeNotifier::new(observer.clone());

        notifier.notify(EntityKind::User);
        notifier.notify(EntityKind::User);
        notifier.notify(EntityKind::Group);
        notifier.notify(EntityKind::User);
        assert!(observer.cache_changes().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(
            observer.cache_changes(),
            vec![EntityKind::User, EntityKind::Group]
        );
    }

    #[test]
    fn notifies_immediately_without_a_runtime() {
        let observer = Arc::new(RecordingObserver::default());
        let notifier = ChangeNotifier::new(observer.clone());

        notifier.notify(EntityKind::Field);
        assert_eq!(observer.cache_changes(), vec![EntityKind::Field]);
    }
}
