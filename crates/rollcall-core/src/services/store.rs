//! Shared snapshot store used by the sync core for durable state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::{Database, KvRepository, LibSqlKvRepository};
use crate::Result;

/// Durable key → JSON text storage.
///
/// Every write must be on durable storage before the future resolves.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;
    async fn save(&self, key: &str, value: &str) -> Result<()>;
    /// Write several keys atomically
    async fn save_many(&self, entries: &[(String, String)]) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Thread-safe libSQL-backed snapshot store.
#[derive(Clone)]
pub struct StoreService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl StoreService {
    /// Open a store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Self::open_with_recovery(&db_path).await?;
        tracing::info!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing database file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    async fn open_with_recovery(db_path: &Path) -> Result<Database> {
        match Database::open(db_path).await {
            Ok(db) => Ok(db),
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local store at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(db_path)?;
                Database::open(db_path).await
            }
            Err(error) => Err(error),
        }
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let base_name = db_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("rollcall.db");
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local store from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        let sidecar_prefix = format!("{base_name}-");

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale store sidecar {}", path.display());
            }
        }

        Ok(())
    }

    /// List every persisted key.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let repo = LibSqlKvRepository::new(db.connection());
        repo.keys().await
    }
}

#[async_trait]
impl SnapshotStore for StoreService {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let repo = LibSqlKvRepository::new(db.connection());
        repo.get(key).await
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKvRepository::new(db.connection());
        repo.put(key, value).await
    }

    async fn save_many(&self, entries: &[(String, String)]) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKvRepository::new(db.connection());
        repo.put_many(entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKvRepository::new(db.connection());
        repo.delete(key).await
    }
}
