use std::sync::Arc;

use rollcall_core::state::SyncState;
use rollcall_core::sync::SyncStatus;
use serde::Serialize;

use crate::commands::common::{GlobalOptions, Session};
use crate::error::CliError;
use crate::observer::ConsoleObserver;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state: &'static str,
    pub remote_configured: bool,
    pub users: usize,
    pub groups: usize,
    pub fields: usize,
    pub errors: usize,
    #[serde(flatten)]
    pub sync: SyncStatus,
}

pub async fn run_status(options: &GlobalOptions, probe: bool, as_json: bool) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    if probe && session.is_remote_configured() {
        session.engine.health().tick().await;
    }

    let report = status_report(&session);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for line in format_status_lines(&report) {
        println!("{line}");
    }
    Ok(())
}

pub fn status_report(session: &Session) -> StatusReport {
    let engine = &session.engine;
    let sync = engine.status();
    StatusReport {
        state: SyncState::from_status(&sync).label(),
        remote_configured: session.is_remote_configured(),
        users: engine.cache().users().len(),
        groups: engine.cache().groups().len(),
        fields: engine.cache().fields().len(),
        errors: engine.context().diagnostics().len(),
        sync,
    }
}

pub fn format_status_lines(report: &StatusReport) -> Vec<String> {
    let mut lines = vec![
        format!("state:       {}", report.state),
        format!(
            "remote:      {}",
            if report.remote_configured {
                "configured"
            } else {
                "not configured"
            }
        ),
        format!(
            "roster:      {} users, {} groups, {} fields",
            report.users, report.groups, report.fields
        ),
        format!("unsynced:    {}", report.sync.unsynced),
        format!("tombstones:  {}", report.sync.tombstones),
        format!("errors:      {}", report.errors),
    ];
    if report.sync.retry_count > 0 {
        lines.push(format!("retries:     {}", report.sync.retry_count));
    }
    if report.sync.memory_only {
        lines.push("storage:     memory only (local store unwritable)".to_string());
    }
    lines
}
