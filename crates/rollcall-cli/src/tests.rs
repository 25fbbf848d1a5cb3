use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use pretty_assertions::assert_eq;
use rollcall_core::config::SyncSettings;
use rollcall_core::models::{Group, User, UserStatus};
use rollcall_core::sync::{DiagnosticEntry, ErrorKind, NoopObserver, Tombstone};
use rollcall_core::{EntityId, EntityKind};

use crate::cli::{Cli, Commands, CompletionShell, GroupCommands, UserCommands};
use crate::commands::common::{
    format_diagnostic_lines, format_group_lines, format_sync_timestamp, format_tombstone_lines,
    format_user_lines, load_settings, truncate, GlobalOptions, Session,
};
use crate::commands::completions::run_completions;
use crate::commands::groups::{apply_group_edit, GroupEdit};
use crate::commands::status::{format_status_lines, status_report};
use crate::commands::sync::{run_sync, run_watch};
use crate::error::CliError;

fn user(id: i64, name: &str, reg: &str) -> User {
    let mut user = User::new(name, reg);
    user.id = EntityId::new(id);
    user
}

fn group(id: i64, name: &str, capacity: u32) -> Group {
    let mut group = Group::new(name, capacity);
    group.id = EntityId::new(id);
    group
}

fn local_options(db_path: &Path) -> GlobalOptions {
    GlobalOptions {
        db_path: db_path.to_path_buf(),
        settings: SyncSettings::default(),
        remote: None,
    }
}

#[test]
fn format_sync_timestamp_returns_utc_label() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn truncate_adds_ellipsis() {
    assert_eq!(truncate("Short", 10), "Short");
    assert_eq!(
        truncate("A group name that is far too long", 12),
        "A group n..."
    );
}

#[test]
fn user_lines_show_group_leader_and_sync_state() {
    let mut ada = user(1, "Ada", "REG001");
    ada.group_id = Some(EntityId::new(10));
    ada.dynamic_fields.is_leader = true;
    let mut bo = user(-7, "Bo", "REG002");
    bo.status = UserStatus::Flagged;

    let rendered = format_user_lines(&[ada, bo], &[group(10, "Blue", 4)]);

    assert_eq!(rendered.len(), 2);
    assert!(rendered[0].contains("Blue"));
    assert!(rendered[0].ends_with("leader"));
    assert!(rendered[1].contains("[flagged]"));
    assert!(rendered[1].contains("(unsynced)"));
    assert!(rendered[1].contains("  -"));
}

#[test]
fn group_lines_show_occupancy_and_leader_name() {
    let mut blue = group(10, "Blue", 4);
    blue.members = vec![EntityId::new(1), EntityId::new(2)];
    blue.leader_id = Some(EntityId::new(1));
    blue.flagged = true;

    let rendered = format_group_lines(&[blue], &[user(1, "Ada", "REG001")]);

    assert!(rendered[0].contains("  2/4"));
    assert!(rendered[0].contains("leader=Ada"));
    assert!(rendered[0].contains("[flagged]"));
}

#[test]
fn tombstone_and_diagnostic_lines_include_key_fields() {
    let tombstones = format_tombstone_lines(&[Tombstone {
        kind: EntityKind::Group,
        id: EntityId::new(42),
    }]);
    assert_eq!(tombstones, vec!["group     42".to_string()]);

    let mut entry = DiagnosticEntry::new(
        "flush",
        Some(EntityKind::User),
        ErrorKind::Conflict,
        "duplicate value on registration_number",
    );
    entry.timestamp = 0;
    let rendered = format_diagnostic_lines(&[entry]);
    assert!(rendered[0].starts_with("1970-01-01 00:00:00 UTC"));
    assert!(rendered[0].contains("flush"));
    assert!(rendered[0].contains("conflict: duplicate value"));
}

#[test]
fn settings_file_overrides_only_given_fields() {
    let path = unique_test_path("settings", "json");
    std::fs::write(&path, r#"{"batch_window_ms": 250}"#).unwrap();

    let settings = load_settings(Some(&path)).unwrap();
    assert_eq!(settings.batch_window_ms, 250);
    assert_eq!(settings.max_batch_size, SyncSettings::default().max_batch_size);

    std::fs::write(&path, r#"{"batch_window": 250}"#).unwrap();
    assert!(matches!(load_settings(Some(&path)), Err(CliError::Config(_))));

    let _ = std::fs::remove_file(path);
}

#[test]
fn missing_settings_path_uses_defaults() {
    assert_eq!(load_settings(None).unwrap(), SyncSettings::default());
}

#[test]
fn provisional_ids_parse_as_arguments() {
    let cli = Cli::try_parse_from(["rollcall", "users", "delete", "-42"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Commands::Users {
            command: UserCommands::Delete { id }
        }) if id == EntityId::new(-42)
    ));

    let cli = Cli::try_parse_from(["rollcall", "groups", "set-leader", "-3"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Commands::Groups {
            command: GroupCommands::SetLeader { group, user: None }
        }) if group == EntityId::new(-3)
    ));
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn run_sync_requires_remote_configuration() {
    let db_path = unique_test_path("sync", "db");
    let options = local_options(&db_path);

    let error = run_sync(&options).await.unwrap_err();
    assert!(matches!(error, CliError::SyncNotConfigured));
    let error = run_watch(&options).await.unwrap_err();
    assert!(matches!(error, CliError::SyncNotConfigured));

    cleanup_db_files(&db_path);
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn local_edits_persist_without_a_remote() {
    let db_path = unique_test_path("roster", "db");
    let options = local_options(&db_path);

    let (group_id, user_id) = {
        let session = Session::open(&options, Arc::new(NoopObserver)).await.unwrap();
        let blue = session
            .engine
            .create_group(Group::new("Blue", 2))
            .await
            .unwrap();
        let ada = session
            .engine
            .create_user(User::new("Ada", "REG001"))
            .await
            .unwrap();
        apply_group_edit(&session, blue.id, GroupEdit::AddMember(ada.id))
            .await
            .unwrap();
        apply_group_edit(&session, blue.id, GroupEdit::SetLeader(Some(ada.id)))
            .await
            .unwrap();
        assert!(session.finish().await.is_none());
        (blue.id, ada.id)
    };

    let session = Session::open(&options, Arc::new(NoopObserver)).await.unwrap();
    let blue = session.engine.cache().group(group_id).unwrap();
    assert_eq!(blue.members, vec![user_id]);
    assert_eq!(blue.leader_id, Some(user_id));
    let ada = session.engine.cache().user(user_id).unwrap();
    assert_eq!(ada.group_id, Some(group_id));
    assert!(ada.dynamic_fields.is_leader);

    let report = status_report(&session);
    assert_eq!(report.state, "offline");
    assert_eq!((report.users, report.groups), (1, 1));
    let lines = format_status_lines(&report);
    assert!(lines.iter().any(|line| line.contains("not configured")));

    cleanup_db_files(&db_path);
}

#[test]
fn group_generation_commands_parse() {
    let cli = Cli::try_parse_from(["rollcall", "groups", "generate", "--size", "4"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Commands::Groups {
            command: GroupCommands::Generate { size: 4 }
        })
    ));

    let cli = Cli::try_parse_from(["rollcall", "groups", "auto-assign"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Commands::Groups {
            command: GroupCommands::AutoAssign
        })
    ));
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn offline_edits_stay_in_the_outbox_across_sessions() {
    let db_path = unique_test_path("outbox", "db");
    let options = local_options(&db_path);

    {
        let session = Session::open(&options, Arc::new(NoopObserver)).await.unwrap();
        for (name, reg) in [("Ada", "REG001"), ("Bo", "REG002"), ("Cy", "REG003")] {
            session.engine.create_user(User::new(name, reg)).await.unwrap();
        }
        session.engine.generate_groups(2).await.unwrap();
        assert_eq!(session.engine.auto_assign().await.unwrap(), 3);
    }

    let session = Session::open(&options, Arc::new(NoopObserver)).await.unwrap();
    let report = status_report(&session);
    assert_eq!(report.groups, 2);
    assert_eq!(report.sync.unsynced, 5);
    assert!(format_status_lines(&report)
        .iter()
        .any(|line| line == "unsynced:    5"));

    cleanup_db_files(&db_path);
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn offline_delete_leaves_a_tombstone() {
    let db_path = unique_test_path("tombstone", "db");
    let options = local_options(&db_path);

    let session = Session::open(&options, Arc::new(NoopObserver)).await.unwrap();
    let ada = session
        .engine
        .create_user(User::new("Ada", "REG001"))
        .await
        .unwrap();
    session.engine.delete_user(ada.id).await.unwrap();
    drop(session);

    let session = Session::open(&options, Arc::new(NoopObserver)).await.unwrap();
    assert!(session.engine.cache().user(ada.id).is_none());
    let tombstones = session.engine.context().tombstones();
    assert!(tombstones.is_deleted(EntityKind::User, ada.id));
    assert_eq!(tombstones.clear_all().await.unwrap(), 1);

    cleanup_db_files(&db_path);
}

#[test]
fn run_completions_writes_bash_script_file() {
    let output_path = unique_test_path("completions", "bash");

    run_completions(CompletionShell::Bash, Some(&output_path)).unwrap();

    let script = std::fs::read_to_string(&output_path).unwrap();
    assert!(script.contains("_rollcall()"));
    assert!(script.contains("complete -F _rollcall"));

    let _ = std::fs::remove_file(output_path);
}

fn unique_test_path(label: &str, extension: &str) -> PathBuf {
    static NEXT_TEST_ID: AtomicU64 = AtomicU64::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let sequence = NEXT_TEST_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "rollcall-cli-{label}-test-{timestamp}-{sequence}.{extension}"
    ))
}

fn cleanup_db_files(path: &PathBuf) {
    // On Windows, libsql can keep file handles alive briefly after drop.
    if cfg!(windows) {
        return;
    }

    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(path.with_extension("db-shm"));
    let _ = std::fs::remove_file(path.with_extension("db-wal"));
}
