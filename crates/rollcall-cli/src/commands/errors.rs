use std::sync::Arc;

use crate::commands::common::{format_diagnostic_lines, GlobalOptions, Session};
use crate::error::CliError;
use crate::observer::ConsoleObserver;

pub async fn run_errors_list(
    options: &GlobalOptions,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    let entries = session
        .engine
        .context()
        .diagnostics()
        .entries()
        .into_iter()
        .rev()
        .take(limit)
        .collect::<Vec<_>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No sync errors recorded.");
    } else {
        for line in format_diagnostic_lines(&entries) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_errors_clear(options: &GlobalOptions) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    session.engine.context().diagnostics().clear().await?;
    println!("Sync error log cleared");
    Ok(())
}
