//! Rollcall CLI - Command-line interface for the roster sync engine
//!
//! Edits land in the local store first and reach the remote when it answers.

mod cli;
mod commands;
mod detached;
mod error;
mod observer;

use clap::{CommandFactory, Parser};

use crate::cli::{Cli, Commands, ErrorCommands, GroupCommands, TombstoneCommands, UserCommands};
use crate::commands::common::GlobalOptions;
use crate::commands::completions::run_completions;
use crate::commands::errors::{run_errors_clear, run_errors_list};
use crate::commands::groups::{
    run_groups_add, run_groups_auto_assign, run_groups_delete, run_groups_edit,
    run_groups_generate, run_groups_list, GroupEdit,
};
use crate::commands::status::run_status;
use crate::commands::sync::{run_sync, run_watch};
use crate::commands::tombstones::{run_tombstones_clear, run_tombstones_list};
use crate::commands::users::{run_users_add, run_users_delete, run_users_list, NewUser};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rollcall=info,rollcall_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    if let Commands::Completions { shell, output } = &command {
        return run_completions(*shell, output.as_deref());
    }

    let options = GlobalOptions::resolve(cli.db_path, cli.settings.as_deref())?;

    match command {
        Commands::Status { probe, json } => run_status(&options, probe, json).await?,
        Commands::Sync => run_sync(&options).await?,
        Commands::Watch => run_watch(&options).await?,
        Commands::Users { command } => match command {
            UserCommands::List { json } => run_users_list(&options, json).await?,
            UserCommands::Add {
                name,
                registration_number,
                email,
                phone,
                group,
            } => {
                let new_user = NewUser {
                    name,
                    registration_number,
                    email,
                    phone,
                    group,
                };
                run_users_add(&options, new_user).await?;
            }
            UserCommands::Delete { id } => run_users_delete(&options, id).await?,
        },
        Commands::Groups { command } => match command {
            GroupCommands::List { json } => run_groups_list(&options, json).await?,
            GroupCommands::Add { name, capacity } => {
                run_groups_add(&options, name, capacity).await?;
            }
            GroupCommands::Generate { size } => run_groups_generate(&options, size).await?,
            GroupCommands::AutoAssign => run_groups_auto_assign(&options).await?,
            GroupCommands::Delete { id } => run_groups_delete(&options, id).await?,
            GroupCommands::AddMember { group, user } => {
                run_groups_edit(&options, group, GroupEdit::AddMember(user)).await?;
            }
            GroupCommands::RemoveMember { group, user } => {
                run_groups_edit(&options, group, GroupEdit::RemoveMember(user)).await?;
            }
            GroupCommands::SetLeader { group, user } => {
                run_groups_edit(&options, group, GroupEdit::SetLeader(user)).await?;
            }
            GroupCommands::Flag { group, clear } => {
                run_groups_edit(&options, group, GroupEdit::Flag(!clear)).await?;
            }
        },
        Commands::Tombstones { command } => match command {
            TombstoneCommands::List { json } => run_tombstones_list(&options, json).await?,
            TombstoneCommands::Clear { kind, id } => {
                run_tombstones_clear(&options, kind.zip(id)).await?;
            }
        },
        Commands::Errors { command } => match command {
            ErrorCommands::List { limit, json } => run_errors_list(&options, limit, json).await?,
            ErrorCommands::Clear => run_errors_clear(&options).await?,
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests;
