use std::io;

use rollcall_core::sync::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] rollcall_core::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),
    #[error(
        "Remote is not configured. Set ROLLCALL_REMOTE_URL and ROLLCALL_REMOTE_KEY to enable `rollcall sync`."
    )]
    SyncNotConfigured,
}
