use std::sync::Arc;

use rollcall_core::{EntityId, EntityKind};

use crate::commands::common::{format_tombstone_lines, GlobalOptions, Session};
use crate::error::CliError;
use crate::observer::ConsoleObserver;

pub async fn run_tombstones_list(options: &GlobalOptions, as_json: bool) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    let mut tombstones = session.engine.context().tombstones().list();
    tombstones.sort();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&tombstones)?);
    } else if tombstones.is_empty() {
        println!("No tombstones recorded.");
    } else {
        for line in format_tombstone_lines(&tombstones) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_tombstones_clear(
    options: &GlobalOptions,
    target: Option<(EntityKind, EntityId)>,
) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    let tombstones = session.engine.context().tombstones();

    match target {
        Some((kind, id)) => {
            if !tombstones.clear(kind, id).await? {
                return Err(CliError::NotFound("Tombstone", format!("{kind} {id}")));
            }
            println!("Cleared tombstone for {kind} {id}");
        }
        None => {
            let cleared = tombstones.clear_all().await?;
            println!("Cleared {cleared} tombstone(s)");
        }
    }
    Ok(())
}
