//! Sync error taxonomy and remote rejection classification.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Postgres SQLSTATE for a unique constraint violation
const UNIQUE_VIOLATION: &str = "23505";
/// Postgres SQLSTATE for a foreign key violation
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Which constraint a conflicting write violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    Unique,
    ForeignKey,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unique => f.write_str("duplicate value"),
            Self::ForeignKey => f.write_str("missing reference"),
        }
    }
}

/// Errors produced by the sync core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Bad input shape or missing required field; never sent to the remote
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unique or foreign-key violation
    #[error("Conflict on {field} ({reason}): {message}")]
    Conflict {
        reason: ConflictReason,
        field: String,
        message: String,
    },

    /// The same operation id is already in flight
    #[error("Operation {0} is already in flight")]
    DuplicateOperation(String),

    /// Transient remote failure
    #[error("Remote error: {0}")]
    Remote(String),

    /// Remote call exceeded its time bound
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Local persistence failed
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Fieldless mirror of [`SyncError`] for observers and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    DuplicateOperation,
    Remote,
    Timeout,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::DuplicateOperation => "duplicate_operation",
            Self::Remote => "remote",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
        };
        f.write_str(label)
    }
}

impl SyncError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::DuplicateOperation(_) => ErrorKind::DuplicateOperation,
            Self::Remote(_) => ErrorKind::Remote,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the batcher may retry the write automatically
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Timeout(_))
    }

    pub(crate) fn unique(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            reason: ConflictReason::Unique,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<crate::Error> for SyncError {
    fn from(error: crate::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        Self::Validation(error.to_string())
    }
}

/// Structured rejection returned by the remote store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl RemoteErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Column named in a `Key (column)=(value)` detail, if any
    #[must_use]
    pub fn constraint_column(&self) -> Option<String> {
        let details = self.details.as_deref().unwrap_or(&self.message);
        let start = details.find("Key (")? + "Key (".len();
        let end = details[start..].find(')')? + start;
        let column = details[start..end].trim();
        (!column.is_empty()).then(|| column.to_string())
    }

    /// Map the rejection onto the sync error taxonomy
    #[must_use]
    pub fn classify(&self) -> SyncError {
        let reason = match self.code.as_deref() {
            Some(UNIQUE_VIOLATION) => Some(ConflictReason::Unique),
            Some(FOREIGN_KEY_VIOLATION) => Some(ConflictReason::ForeignKey),
            _ => None,
        };

        match reason {
            Some(reason) => SyncError::Conflict {
                reason,
                field: self
                    .constraint_column()
                    .unwrap_or_else(|| "unknown".to_string()),
                message: self.message.clone(),
            },
            None => SyncError::Remote(self.to_string()),
        }
    }
}

impl fmt::Display for RemoteErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message.trim())?;
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        if let Some(status) = self.status {
            write!(f, " ({status})")?;
        }
        Ok(())
    }
}
