#[cfg(test)]
use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use thiserror::Error;
#[cfg(test)]
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable string records keyed by name. Each key holds one whole value that is
/// overwritten on every write; there is no partial update.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;
}

#[derive(Clone)]
pub struct SqliteKeyValueStore {
    pool: Pool<Sqlite>,
}

impl SqliteKeyValueStore {
    pub async fn initialize(database_url: Option<String>) -> Result<Self, StorageError> {
        let url = match database_url {
            Some(u) => u,
            None => default_database_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(%url, "key-value store ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

/// `sqlite://$XDG_DATA_HOME/workflow_hub/hub.db`, creating the directory.
pub fn default_database_url() -> Result<String, StorageError> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("workflow_hub");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("hub.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let res = sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

/// Process-local store; nothing survives the process.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

#[cfg(test)]
#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sqlite_url(dir: &tempfile::TempDir) -> String {
        format!("sqlite://{}", dir.path().join("test.db").to_string_lossy())
    }

    #[tokio::test]
    async fn set_get_overwrite_remove() {
        let dir = tempdir().unwrap();
        let store = SqliteKeyValueStore::initialize(Some(sqlite_url(&dir))).await.unwrap();

        assert_eq!(store.get("access_token").await.unwrap(), None);
        store.set("access_token", "a1").await.unwrap();
        assert_eq!(store.get("access_token").await.unwrap().as_deref(), Some("a1"));

        store.set("access_token", "a2").await.unwrap();
        assert_eq!(store.get("access_token").await.unwrap().as_deref(), Some("a2"));

        assert!(store.remove("access_token").await.unwrap());
        assert!(!store.remove("access_token").await.unwrap());
        assert_eq!(store.get("access_token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        let store = SqliteKeyValueStore::initialize(Some(sqlite_url(&dir))).await.unwrap();
        store.set("chatMessages", "{\"RAG\":[]}").await.unwrap();
        drop(store);

        let reopened = SqliteKeyValueStore::initialize(Some(sqlite_url(&dir))).await.unwrap();
        assert_eq!(reopened.get("chatMessages").await.unwrap().as_deref(), Some("{\"RAG\":[]}"));
    }

    #[tokio::test]
    async fn pragmas_and_migrations_applied() {
        let dir = tempdir().unwrap();
        let store = SqliteKeyValueStore::initialize(Some(sqlite_url(&dir))).await.unwrap();

        let row = sqlx::query("PRAGMA journal_mode;").fetch_one(store.pool()).await.unwrap();
        let mode: String = row.get(0);
        assert!(mode.eq_ignore_ascii_case("wal"), "journal_mode should be WAL, got {}", mode);

        let row = sqlx::query("PRAGMA busy_timeout;").fetch_one(store.pool()).await.unwrap();
        let timeout: i64 = row.get(0);
        assert!(timeout >= 5000, "busy_timeout should be at least 5000, got {}", timeout);

        // re-running migrations on the same file is a no-op
        let _again = SqliteKeyValueStore::initialize(Some(sqlite_url(&dir))).await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_behaves_like_sqlite() {
        let store = MemoryKeyValueStore::default();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.remove("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
