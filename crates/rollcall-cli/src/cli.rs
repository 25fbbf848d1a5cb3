use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::{EntityId, EntityKind};

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "Manage a roster offline and sync it when the remote is reachable")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional JSON file overriding sync timings and limits
    #[arg(long, global = true, value_name = "PATH")]
    pub settings: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show local sync state
    Status {
        /// Probe the remote before reporting
        #[arg(long)]
        probe: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reconcile with the remote and push local changes
    Sync,
    /// Stay connected and print remote changes as they arrive
    Watch,
    /// Manage users
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Manage groups
    Groups {
        #[command(subcommand)]
        command: GroupCommands,
    },
    /// Inspect or clear deletion markers
    Tombstones {
        #[command(subcommand)]
        command: TombstoneCommands,
    },
    /// Inspect or clear recorded sync failures
    Errors {
        #[command(subcommand)]
        command: ErrorCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// List users
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Register a new user
    Add {
        /// Full name
        name: String,
        /// Registration number
        #[arg(long = "reg", value_name = "NUMBER")]
        registration_number: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        /// Group to place the user in
        #[arg(long, value_name = "ID", allow_negative_numbers = true)]
        group: Option<EntityId>,
    },
    /// Delete a user
    Delete {
        #[arg(allow_negative_numbers = true)]
        id: EntityId,
    },
}

#[derive(Subcommand)]
pub enum GroupCommands {
    /// List groups
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a group
    Add {
        name: String,
        /// Maximum number of members
        #[arg(long, default_value = "10")]
        capacity: u32,
    },
    /// Create enough groups of one size to seat every user
    Generate {
        /// Members per group
        #[arg(long)]
        size: u32,
    },
    /// Spread every user over the existing groups
    AutoAssign,
    /// Delete a group and release its members
    Delete {
        #[arg(allow_negative_numbers = true)]
        id: EntityId,
    },
    /// Place a user in a group, leaving any previous group
    AddMember {
        #[arg(allow_negative_numbers = true)]
        group: EntityId,
        #[arg(allow_negative_numbers = true)]
        user: EntityId,
    },
    /// Take a user out of a group
    RemoveMember {
        #[arg(allow_negative_numbers = true)]
        group: EntityId,
        #[arg(allow_negative_numbers = true)]
        user: EntityId,
    },
    /// Assign the group leader, or clear it when no user is given
    SetLeader {
        #[arg(allow_negative_numbers = true)]
        group: EntityId,
        #[arg(allow_negative_numbers = true)]
        user: Option<EntityId>,
    },
    /// Flag a group and its members
    Flag {
        #[arg(allow_negative_numbers = true)]
        group: EntityId,
        /// Remove the flag instead
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand)]
pub enum TombstoneCommands {
    /// List deletion markers
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget one marker, or all of them when no id is given
    Clear {
        /// Entity kind (user, group, field, setting)
        #[arg(requires = "id")]
        kind: Option<EntityKind>,
        #[arg(allow_negative_numbers = true)]
        id: Option<EntityId>,
    },
}

#[derive(Subcommand)]
pub enum ErrorCommands {
    /// List recent sync failures, newest first
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear the failure log
    Clear,
}
