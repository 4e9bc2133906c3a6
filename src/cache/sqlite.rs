use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use super::{CacheEntry, CacheKind, CacheStore};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed cache store, persistent across runs
#[derive(Clone)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    /// Open (or create) the cache database at the configured path
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                    message: format!("Failed to create database directory: {}", e),
                })?;
            }
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Throwaway in-memory database. A single connection keeps every query
    /// on the same database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running cache migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Cache migrations completed");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        let row: Option<CacheRow> = sqlx::query_as(
            r#"
            SELECT cache_key, kind, payload, created_at, ttl_secs
            FROM cache_entries
            WHERE cache_key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CacheEntry::try_from).transpose()
    }

    async fn put(&self, entry: &CacheEntry) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (cache_key, kind, payload, created_at, ttl_secs)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                created_at = excluded.created_at,
                ttl_secs = excluded.ttl_secs
            "#,
        )
        .bind(&entry.key)
        .bind(entry.kind.as_str())
        .bind(&entry.payload)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.ttl.map(|ttl| ttl.num_seconds()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn clear(&self, kind: Option<CacheKind>) -> StorageResult<u64> {
        let result = match kind {
            Some(kind) => {
                sqlx::query("DELETE FROM cache_entries WHERE kind = ?")
                    .bind(kind.as_str())
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM cache_entries")
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    cache_key: String,
    kind: String,
    payload: String,
    created_at: String,
    ttl_secs: Option<i64>,
}

impl TryFrom<CacheRow> for CacheEntry {
    type Error = StorageError;

    fn try_from(row: CacheRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| StorageError::Corrupt {
            key: row.cache_key.clone(),
            message,
        };

        let kind = CacheKind::from_str(&row.kind).map_err(|e| corrupt(e.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| corrupt(format!("bad timestamp '{}': {}", row.created_at, e)))?
            .with_timezone(&Utc);

        Ok(CacheEntry {
            key: row.cache_key,
            kind,
            payload: row.payload,
            created_at,
            ttl: row.ttl_secs.map(Duration::seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_preserves_ttl() {
        let store = SqliteCacheStore::new_in_memory().await.unwrap();
        let entry = CacheEntry {
            key: "catalog/2023".to_string(),
            kind: CacheKind::Catalog,
            payload: "[]".to_string(),
            created_at: Utc::now(),
            ttl: Some(Duration::days(14)),
        };
        store.put(&entry).await.unwrap();

        let loaded = store.get("catalog/2023").await.unwrap().unwrap();
        assert_eq!(loaded.kind, CacheKind::Catalog);
        assert_eq!(loaded.ttl, Some(Duration::days(14)));
        assert_eq!(loaded.payload, "[]");
    }

    #[tokio::test]
    async fn test_bad_timestamp_is_corrupt() {
        let store = SqliteCacheStore::new_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO cache_entries (cache_key, kind, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind("region_areas/2024/22")
        .bind("region_areas")
        .bind("{}")
        .bind("yesterday")
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.get("region_areas/2024/22").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
