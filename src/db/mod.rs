//! Durable state: the mutation queue, the profile snapshot, the update snooze and the cache
//! snapshot.
//!
//! The engine only sees the [`Store`] trait. [`Db`] implements it on SQLite and [`MemoryStore`]
//! keeps everything in memory for tests.

mod memory;
mod migrations;

pub use memory::MemoryStore;

use crate::error::EngineError;
use crate::queue::PendingOperation;
use crate::Result;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// The schema version this build of the crate expects.
const CURRENT_VERSION: i32 = 1;

/// Keys of the small values kept next to the queue.
pub(crate) mod keys {
    pub(crate) const PROFILE: &str = "profile";
    pub(crate) const SNOOZED_UNTIL: &str = "update.snoozed_until";
    pub(crate) const CACHE_SNAPSHOT: &str = "cache.snapshot";
}

/// Durable storage contract of the engine. Queue writes go through immediately so that a process
/// restart never loses an accepted write.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// All stored operations in insertion order.
    async fn load_operations(&self) -> Result<Vec<PendingOperation>>;

    /// Stores a new operation and returns the id it was assigned. Ids are never reused.
    async fn insert_operation(&self, op: &PendingOperation) -> Result<i64>;

    async fn update_operation(&self, op: &PendingOperation) -> Result<()>;

    async fn delete_operation(&self, id: i64) -> Result<()>;

    async fn get_state(&self, key: &str) -> Result<Option<String>>;

    async fn set_state(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_state(&self, key: &str) -> Result<()>;
}

/// Reads a JSON value stored under `key`.
pub(crate) async fn load_state<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>> {
    match store.get_state(key).await? {
        None => Ok(None),
        Some(json) => serde_json::from_str(&json)
            .with_context(|| format!("Unable to parse stored state '{key}'"))
            .map(Some),
    }
}

/// Stores `value` as JSON under `key`.
pub(crate) async fn save_state<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)
        .with_context(|| format!("Unable to serialize state '{key}'"))?;
    store.set_state(key, &json).await
}

/// The SQLite implementation of [`Store`].
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// - Validates that there is a SQLite file at `path`
    /// - Creates a SQLite client
    /// - Updates the database schema with migrations if it is out-of-date
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(
            path.is_file(),
            "The SQLite database is missing '{}'",
            path.display()
        );
        let db = Self::connect(path, false).await?;
        let version = db.schema_version().await?;
        migrations::run(&db.pool, version, CURRENT_VERSION).await?;
        Ok(db)
    }

    /// - Validates that no file currently exists at `path`
    /// - Creates a new SQLite file at `path`
    /// - Initializes the database schema
    pub async fn init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(
            !path.exists(),
            "A SQLite database already exists at '{}'",
            path.display()
        );
        let db = Self::connect(path, true).await?;
        sqlx::query("CREATE TABLE schema_version (version INTEGER NOT NULL)")
            .execute(&db.pool)
            .await
            .context("Failed to create schema_version table")?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (0)")
            .execute(&db.pool)
            .await
            .context("Failed to insert initial schema version")?;
        migrations::run(&db.pool, 0, CURRENT_VERSION).await?;
        Ok(db)
    }

    async fn connect(path: &Path, create: bool) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .context("Failed to parse SQLite connection string")?
            .create_if_missing(create);
        // A single connection keeps queue writes strictly ordered.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database '{}'", path.display()))?;
        debug!("Opened SQLite database {}", path.display());
        Ok(Self { pool })
    }

    async fn schema_version(&self) -> Result<i32> {
        let row: (i32,) = sqlx::query_as("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await
            .context("Failed to query schema version")?;
        Ok(row.0)
    }

    /// Number of stored queue entries.
    pub async fn count_operations(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_operations")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count pending operations")?;
        Ok(row.0 as u64)
    }
}

#[async_trait::async_trait]
impl Store for Db {
    async fn load_operations(&self) -> Result<Vec<PendingOperation>> {
        let rows = sqlx::query("SELECT id, body FROM pending_operations ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read pending operations")?;
        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let body: String = row.try_get("body")?;
            let mut op: PendingOperation = serde_json::from_str(&body).map_err(|e| {
                EngineError::CorruptEntry {
                    id,
                    message: e.to_string(),
                }
            })?;
            op.id = id;
            ops.push(op);
        }
        Ok(ops)
    }

    async fn insert_operation(&self, op: &PendingOperation) -> Result<i64> {
        let body = serde_json::to_string(op).context("Unable to serialize queue entry")?;
        let result = sqlx::query("INSERT INTO pending_operations (body) VALUES (?)")
            .bind(body)
            .execute(&self.pool)
            .await
            .context("Failed to insert queue entry")?;
        Ok(result.last_insert_rowid())
    }

    async fn update_operation(&self, op: &PendingOperation) -> Result<()> {
        let body = serde_json::to_string(op).context("Unable to serialize queue entry")?;
        let result = sqlx::query("UPDATE pending_operations SET body = ? WHERE id = ?")
            .bind(body)
            .bind(op.id)
            .execute(&self.pool)
            .await
            .context("Failed to update queue entry")?;
        anyhow::ensure!(
            result.rows_affected() == 1,
            "Queue entry {} is not stored",
            op.id
        );
        Ok(())
    }

    async fn delete_operation(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pending_operations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete queue entry")?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read state '{key}'"))?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_state (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write state '{key}'"))?;
        Ok(())
    }

    async fn remove_state(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM app_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to remove state '{key}'"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, EntityRef, TempId};
    use crate::queue::{DeliveryStatus, OperationKind, Payload};
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn delete_op(target: i64) -> PendingOperation {
        PendingOperation {
            id: 0,
            kind: OperationKind::Delete,
            entity: EntityKind::Transaction,
            target: EntityRef::Confirmed(target),
            payload: Payload::Empty,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            idempotency_key: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_init_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fintrack.sqlite");
        let db = Db::init(&path).await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), CURRENT_VERSION);
        assert!(Db::init(&path).await.is_err());
        drop(db);
        let db = Db::load(&path).await.unwrap();
        assert_eq!(db.count_operations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_requires_file() {
        let dir = TempDir::new().unwrap();
        assert!(Db::load(dir.path().join("missing.sqlite")).await.is_err());
    }

    #[tokio::test]
    async fn test_operations_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fintrack.sqlite");
        let db = Db::init(&path).await.unwrap();
        let first = db.insert_operation(&delete_op(1)).await.unwrap();
        let second = db.insert_operation(&delete_op(2)).await.unwrap();
        assert!(second > first);

        let mut op = delete_op(2);
        op.id = second;
        op.target = EntityRef::Temp(TempId::fixed("x"));
        op.status = DeliveryStatus::Failed;
        db.update_operation(&op).await.unwrap();
        db.delete_operation(first).await.unwrap();
        drop(db);

        let db = Db::load(&path).await.unwrap();
        let ops = db.load_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, second);
        assert_eq!(ops[0].status, DeliveryStatus::Failed);
        assert!(ops[0].target.is_temp());

        // Ids are not reused after a delete.
        let third = db.insert_operation(&delete_op(3)).await.unwrap();
        assert!(third > second);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_reported() {
        let dir = TempDir::new().unwrap();
        let db = Db::init(dir.path().join("fintrack.sqlite")).await.unwrap();
        sqlx::query("INSERT INTO pending_operations (body) VALUES ('{not json')")
            .execute(&db.pool)
            .await
            .unwrap();
        let err = db.load_operations().await.unwrap_err();
        let engine = EngineError::from_storage(err);
        assert!(matches!(engine, EngineError::CorruptEntry { .. }));
    }

    #[tokio::test]
    async fn test_state_values() {
        let dir = TempDir::new().unwrap();
        let db = Db::init(dir.path().join("fintrack.sqlite")).await.unwrap();
        assert_eq!(db.get_state(keys::PROFILE).await.unwrap(), None);
        save_state(&db, keys::SNOOZED_UNTIL, &42_i64).await.unwrap();
        save_state(&db, keys::SNOOZED_UNTIL, &43_i64).await.unwrap();
        let value: Option<i64> = load_state(&db, keys::SNOOZED_UNTIL).await.unwrap();
        assert_eq!(value, Some(43));
        db.remove_state(keys::SNOOZED_UNTIL).await.unwrap();
        assert_eq!(db.get_state(keys::SNOOZED_UNTIL).await.unwrap(), None);
    }
}
