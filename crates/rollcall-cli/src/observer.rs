use rollcall_core::sync::{ErrorKind, Severity, SyncObserver};
use rollcall_core::EntityKind;

/// Prints sync notices to stderr.
///
/// With `follow_changes` set, cache updates are echoed too, which is what
/// `rollcall watch` shows.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleObserver {
    follow_changes: bool,
}

impl ConsoleObserver {
    pub const fn following() -> Self {
        Self {
            follow_changes: true,
        }
    }
}

impl SyncObserver for ConsoleObserver {
    fn on_cache_changed(&self, kind: EntityKind) {
        if self.follow_changes {
            println!("{} changed", kind.table());
        }
    }

    fn on_connectivity_changed(&self, connected: bool) {
        if self.follow_changes {
            println!("{}", if connected { "online" } else { "offline" });
        }
    }

    fn on_sync_error(&self, kind: Option<EntityKind>, error: ErrorKind, detail: &str) {
        tracing::debug!(?kind, %error, detail, "Sync error");
    }

    fn on_notice(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Success => eprintln!("{message}"),
            Severity::Warning => eprintln!("warning: {message}"),
            Severity::Error => eprintln!("error: {message}"),
        }
    }
}
