use std::sync::Arc;

use rollcall_core::sync::{ReconcileReport, SyncEngine};

use crate::commands::common::{GlobalOptions, Session};
use crate::error::CliError;
use crate::observer::ConsoleObserver;

pub async fn run_sync(options: &GlobalOptions) -> Result<(), CliError> {
    options.require_remote()?;
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;

    let reconcile = session.engine.reconcile().await;
    for line in format_reconcile_lines(&reconcile) {
        println!("{line}");
    }
    if reconcile.all_failed() {
        println!("Remote unreachable; local changes are kept for the next sync");
        return Ok(());
    }

    let flush = session.engine.shutdown().await;
    println!(
        "Pushed {} change(s), {} rejected, {} waiting for retry",
        flush.committed,
        flush.rejected,
        flush.retrying + flush.parked
    );
    Ok(())
}

/// Keep the engine running with live feeds and health checks until Ctrl-C.
pub async fn run_watch(options: &GlobalOptions) -> Result<(), CliError> {
    options.require_remote()?;
    let session = Session::open(options, Arc::new(ConsoleObserver::following())).await?;
    let engine: &SyncEngine = &session.engine;

    let report = engine.boot().await;
    for line in format_reconcile_lines(&report) {
        println!("{line}");
    }
    println!("Watching for changes (Ctrl-C to stop)");

    tokio::signal::ctrl_c().await?;
    let flush = engine.shutdown().await;
    println!("Stopped; pushed {} change(s)", flush.committed);
    Ok(())
}

pub fn format_reconcile_lines(report: &ReconcileReport) -> Vec<String> {
    report
        .kinds
        .iter()
        .map(|(kind, outcome)| match outcome {
            Ok(kind_report) => format!(
                "{:<22}  fetched={} added={} kept_local={} suppressed={} deletes_reissued={}",
                kind.table(),
                kind_report.fetched,
                kind_report.added,
                kind_report.kept_local,
                kind_report.suppressed,
                kind_report.deletes_reissued
            ),
            Err(error) => format!("{:<22}  failed: {error}", kind.table()),
        })
        .collect()
}
