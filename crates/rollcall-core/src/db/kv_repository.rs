//! Key-value snapshot repository

use crate::error::{Error, Result};
use crate::models::now_millis;
use libsql::Connection;

/// Trait for key-value snapshot storage (async)
#[allow(async_fn_in_trait)]
pub trait KvRepository {
    /// Read the raw value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace the value stored under `key`
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Write several entries in one transaction
    async fn put_many(&self, entries: &[(String, String)]) -> Result<()>;

    /// Remove `key`; missing keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// List stored keys in lexical order
    async fn keys(&self) -> Result<Vec<String>>;
}

/// libSQL implementation of `KvRepository`
pub struct LibSqlKvRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlKvRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl KvRepository for LibSqlKvRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM kv_store WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("kv key must not be empty".into()));
        }

        self.conn
            .execute(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
                libsql::params![key, value, now_millis()],
            )
            .await?;
        Ok(())
    }

    async fn put_many(&self, entries: &[(String, String)]) -> Result<()> {
        if entries.iter().any(|(key, _)| key.trim().is_empty()) {
            return Err(Error::InvalidInput("kv key must not be empty".into()));
        }

        let now = now_millis();
        let tx = self.conn.transaction().await?;
        for (key, value) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
                libsql::params![key.as_str(), value.as_str(), now],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv_store WHERE key = ?", [key])
            .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query("SELECT key FROM kv_store ORDER BY key ASC", ())
            .await?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await? {
            keys.push(row.get::<String>(0)?);
        }
        Ok(keys)
    }
}
