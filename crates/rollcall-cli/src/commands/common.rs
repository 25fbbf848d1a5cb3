use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rollcall_core::config::{RemoteConfig, SyncSettings};
use rollcall_core::models::{Group, User, UserStatus};
use rollcall_core::services::StoreService;
use rollcall_core::sync::{
    DiagnosticEntry, FlushReport, HttpRemoteStore, RemoteStore, SyncContext, SyncEngine,
    SyncObserver, Tombstone,
};
use rollcall_core::EntityId;

use crate::detached::DetachedRemote;
use crate::error::CliError;

/// Options shared by every command
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub db_path: PathBuf,
    pub settings: SyncSettings,
    pub remote: Option<RemoteConfig>,
}

impl GlobalOptions {
    pub fn resolve(
        cli_db_path: Option<PathBuf>,
        settings_path: Option<&Path>,
    ) -> Result<Self, CliError> {
        Ok(Self {
            db_path: resolve_db_path(cli_db_path),
            settings: load_settings(settings_path)?,
            remote: remote_config_from_env()?,
        })
    }

    pub fn require_remote(&self) -> Result<&RemoteConfig, CliError> {
        self.remote.as_ref().ok_or(CliError::SyncNotConfigured)
    }
}

/// An engine over the local store, wired to the remote when one is configured
pub struct Session {
    pub engine: SyncEngine,
    remote_configured: bool,
}

impl Session {
    pub async fn open(
        options: &GlobalOptions,
        observer: Arc<dyn SyncObserver>,
    ) -> Result<Self, CliError> {
        let store = Arc::new(StoreService::open_path(&options.db_path).await?);
        let ctx = SyncContext::open(store, observer, options.settings.clone()).await;

        let remote: Arc<dyn RemoteStore> = match options.remote.as_ref() {
            Some(config) => Arc::new(HttpRemoteStore::new(config)?),
            None => Arc::new(DetachedRemote),
        };

        Ok(Self {
            engine: SyncEngine::new(ctx, remote),
            remote_configured: options.remote.is_some(),
        })
    }

    pub const fn is_remote_configured(&self) -> bool {
        self.remote_configured
    }

    /// Catch up with the remote before a local edit
    pub async fn prepare(&self) {
        if self.remote_configured {
            self.engine.reconcile().await;
        }
    }

    /// Push whatever the edit queued.
    ///
    /// Returns `None` when the edit stays local.
    pub async fn finish(&self) -> Option<FlushReport> {
        if self.remote_configured && self.engine.context().is_connected() {
            Some(self.engine.shutdown().await)
        } else {
            None
        }
    }
}

pub fn print_finish(report: Option<FlushReport>) {
    match report {
        Some(report) if report.parked > 0 || report.retrying > 0 => {
            println!(
                "Saved locally; {} change(s) will be retried on the next sync",
                report.parked + report.retrying
            );
        }
        Some(_) => {}
        None => println!("Saved locally; run `rollcall sync` to push it"),
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("ROLLCALL_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("rollcall")
        .join("rollcall.db")
}

pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings, CliError> {
    let Some(path) = path else {
        return Ok(SyncSettings::default());
    };
    let payload = std::fs::read_to_string(path)?;
    SyncSettings::from_json(&payload)
        .map_err(|error| CliError::Config(format!("{}: {error}", path.display())))
}

fn remote_config_from_env() -> Result<Option<RemoteConfig>, CliError> {
    RemoteConfig::from_parts(
        env::var("ROLLCALL_REMOTE_URL").ok(),
        env::var("ROLLCALL_REMOTE_KEY").ok(),
    )
    .map_err(CliError::Config)
}

pub fn format_user_lines(users: &[User], groups: &[Group]) -> Vec<String> {
    let group_names = groups
        .iter()
        .map(|group| (group.id, group.name.as_str()))
        .collect::<HashMap<EntityId, &str>>();

    users
        .iter()
        .map(|user| {
            let group = user
                .group_id
                .map_or("-", |id| group_names.get(&id).copied().unwrap_or("?"));
            let mut line = format!(
                "{:<20}  {:<24}  {:<12}  {group}",
                user.id.to_string(),
                truncate(&user.name, 24),
                user.registration_number
            );
            if user.dynamic_fields.is_leader {
                line.push_str("  leader");
            }
            if user.status != UserStatus::Active {
                line.push_str(&format!("  [{}]", status_label(user.status)));
            }
            if user.id.is_provisional() {
                line.push_str("  (unsynced)");
            }
            line
        })
        .collect()
}

pub fn format_group_lines(groups: &[Group], users: &[User]) -> Vec<String> {
    let user_names = users
        .iter()
        .map(|user| (user.id, user.name.as_str()))
        .collect::<HashMap<EntityId, &str>>();

    groups
        .iter()
        .map(|group| {
            let leader = group
                .leader_id
                .map_or("-", |id| user_names.get(&id).copied().unwrap_or("?"));
            let mut line = format!(
                "{:<20}  {:<24}  {:>3}/{:<3}  leader={leader}",
                group.id.to_string(),
                truncate(&group.name, 24),
                group.members.len(),
                group.capacity
            );
            if group.flagged {
                line.push_str("  [flagged]");
            }
            if group.id.is_provisional() {
                line.push_str("  (unsynced)");
            }
            line
        })
        .collect()
}

pub fn format_tombstone_lines(tombstones: &[Tombstone]) -> Vec<String> {
    tombstones
        .iter()
        .map(|tombstone| format!("{:<8}  {}", tombstone.kind.label(), tombstone.id))
        .collect()
}

pub fn format_diagnostic_lines(entries: &[DiagnosticEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let kind = entry.kind.map_or("-", |kind| kind.label());
            format!(
                "{}  {:<12}  {kind:<7}  {}: {}",
                format_sync_timestamp(entry.timestamp),
                entry.operation,
                entry.error_kind,
                entry.message
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub const fn status_label(status: UserStatus) -> &'static str {
    match status {
        UserStatus::Active => "active",
        UserStatus::Flagged => "flagged",
        UserStatus::Inactive => "inactive",
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = text.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}
