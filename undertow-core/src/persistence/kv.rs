//! Bucketed key/value cache with lazy expiry, backed by `cache.db`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;

use super::PersistenceError;
use super::database::connect;

/// Handle on `cache.db`.
#[derive(Debug, Clone)]
pub struct KvStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl KvStore {
    /// # Errors
    ///
    /// - `PersistenceError::Open` - File missing, locked or not a database
    pub async fn open(path: &Path) -> Result<Self, PersistenceError> {
        let pool = connect(path, false).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                PRIMARY KEY (bucket, key)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|source| PersistenceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stores `value`; with a `ttl` the entry expires that long from now.
    pub async fn set(&self, bucket: &str, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), PersistenceError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = ttl.map(|ttl| now.saturating_add(ttl.as_millis() as i64));
        sqlx::query(
            "INSERT INTO kv (bucket, key, value, updated_at, expires_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (bucket, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
        )
        .bind(bucket)
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads a value, deleting it instead when it has expired.
    pub async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let row = sqlx::query("SELECT value, expires_at FROM kv WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: Option<i64> = row.try_get("expires_at")?;
        if expires_at.is_some_and(|at| at <= Utc::now().timestamp_millis()) {
            self.delete(bucket, key).await?;
            return Ok(None);
        }
        Ok(Some(row.try_get("value")?))
    }

    pub async fn set_json<T: Serialize>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError> {
        let encoded = serde_json::to_vec(value).map_err(PersistenceError::encode)?;
        self.set(bucket, key, &encoded, ttl).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>, PersistenceError> {
        match self.get(bucket, key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(PersistenceError::decode),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM kv WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Live keys of a bucket.
    pub async fn keys(&self, bucket: &str) -> Result<Vec<String>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT key FROM kv WHERE bucket = ? AND (expires_at IS NULL OR expires_at > ?) ORDER BY key",
        )
        .bind(bucket)
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(PersistenceError::from))
            .collect()
    }

    /// Deletes every expired entry. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_expire_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(&dir.path().join("cache.db")).await.unwrap();
        kv.set("trackers", "a", b"fresh", None).await.unwrap();
        kv.set("trackers", "b", b"stale", Some(Duration::ZERO)).await.unwrap();

        assert_eq!(kv.get("trackers", "a").await.unwrap().as_deref(), Some(&b"fresh"[..]));
        assert_eq!(kv.keys("trackers").await.unwrap(), vec!["a".to_string()]);
        assert_eq!(kv.get("trackers", "b").await.unwrap(), None);
        assert!(!kv.delete("trackers", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_and_json_values() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(&dir.path().join("cache.db")).await.unwrap();
        kv.set_json("meta", "x", &vec![1u32, 2, 3], Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        kv.set("meta", "old", b"1", Some(Duration::ZERO)).await.unwrap();
        kv.set("other", "old", b"2", Some(Duration::ZERO)).await.unwrap();

        assert_eq!(kv.purge_expired().await.unwrap(), 2);
        assert_eq!(kv.get_json::<Vec<u32>>("meta", "x").await.unwrap(), Some(vec![1, 2, 3]));
    }
}
