//! Relational store: torrent items, torrent history and settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};

use super::PersistenceError;
use crate::torrent::{InfoHash, MediaContext, MediaType, TorrentItem, TorrentItemState};

/// Latest schema version applied by [`AppDatabase::open`].
pub const SCHEMA_VERSION: u32 = 2;

struct Migration {
    version: u32,
    description: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "torrent tables",
        statements: &[
            "CREATE TABLE IF NOT EXISTS torrent_info (
                infohash TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                media_id INTEGER NOT NULL DEFAULT 0,
                media_type TEXT NOT NULL DEFAULT 'unknown',
                files TEXT NOT NULL DEFAULT '[]',
                context TEXT NOT NULL DEFAULT '{}'
            )",
            "CREATE TABLE IF NOT EXISTS torrent_history (
                infohash TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                metainfo_blob BLOB
            )",
        ],
    },
    Migration {
        version: 2,
        description: "item state index",
        statements: &["CREATE INDEX IF NOT EXISTS torrent_info_state ON torrent_info (state)"],
    },
];

/// One `torrent_history` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub info_hash: InfoHash,
    pub name: String,
    pub added_at: DateTime<Utc>,
    /// Complete .torrent encoding, once metadata is known
    pub metainfo: Option<Vec<u8>>,
}

/// Handle on `app.db`.
#[derive(Debug, Clone)]
pub struct AppDatabase {
    pool: SqlitePool,
    path: PathBuf,
}

impl AppDatabase {
    /// Opens or creates the database and applies pending migrations.
    ///
    /// # Errors
    ///
    /// - `PersistenceError::Open` - File missing, locked or not a database
    /// - `PersistenceError::Migration` - A migration script failed
    pub async fn open(path: &Path) -> Result<Self, PersistenceError> {
        let pool = connect(path, false).await?;
        let database = Self {
            pool,
            path: path.to_path_buf(),
        };
        database.migrate().await?;
        Ok(database)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<u32, PersistenceError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS settings (name TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.pool)
            .await
            .map_err(|source| PersistenceError::Open {
                path: self.path.clone(),
                source,
            })?;

        let mut current = self.schema_version().await?;
        for migration in MIGRATIONS.iter().filter(move |m| m.version > current) {
            let mut tx = self.pool.begin().await?;
            for statement in migration.statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|source| PersistenceError::Migration {
                        version: migration.version,
                        source,
                    })?;
            }
            sqlx::query(
                "INSERT INTO settings (name, value) VALUES ('schema_version', ?)
                 ON CONFLICT (name) DO UPDATE SET value = excluded.value",
            )
            .bind(migration.version.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            current = migration.version;
            tracing::info!(version = migration.version, "Applied migration: {}", migration.description);
        }
        Ok(current)
    }

    pub async fn schema_version(&self) -> Result<u32, PersistenceError> {
        Ok(self
            .setting("schema_version")
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    pub async fn setting(&self, name: &str) -> Result<Option<String>, PersistenceError> {
        let row = sqlx::query("SELECT value FROM settings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.try_get::<String, _>("value")).transpose()?)
    }

    pub async fn set_setting(&self, name: &str, value: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO settings (name, value) VALUES (?, ?)
             ON CONFLICT (name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts or replaces the item keyed by its infohash.
    pub async fn save_item(&self, item: &TorrentItem) -> Result<(), PersistenceError> {
        let files = serde_json::to_string(&item.files).map_err(PersistenceError::encode)?;
        let context = serde_json::to_string(&item.context).map_err(PersistenceError::encode)?;
        sqlx::query(
            "INSERT INTO torrent_info (infohash, state, media_id, media_type, files, context)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (infohash) DO UPDATE SET
                state = excluded.state,
                media_id = excluded.media_id,
                media_type = excluded.media_type,
                files = excluded.files,
                context = excluded.context",
        )
        .bind(item.info_hash.to_string())
        .bind(item.state.as_str())
        .bind(item.media_id)
        .bind(item.media_type.as_str())
        .bind(files)
        .bind(context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn item(&self, info_hash: InfoHash) -> Result<Option<TorrentItem>, PersistenceError> {
        let row = sqlx::query("SELECT * FROM torrent_info WHERE infohash = ?")
            .bind(info_hash.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| item_from_row(&row)).transpose()
    }

    pub async fn items_with_state(&self, state: TorrentItemState) -> Result<Vec<TorrentItem>, PersistenceError> {
        let rows = sqlx::query("SELECT * FROM torrent_info WHERE state = ? ORDER BY infohash")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Returns whether a row was updated.
    pub async fn set_item_state(&self, info_hash: InfoHash, state: TorrentItemState) -> Result<bool, PersistenceError> {
        let result = sqlx::query("UPDATE torrent_info SET state = ? WHERE infohash = ?")
            .bind(state.as_str())
            .bind(info_hash.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes the item and its history row.
    pub async fn delete_item(&self, info_hash: InfoHash) -> Result<bool, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM torrent_info WHERE infohash = ?")
            .bind(info_hash.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM torrent_history WHERE infohash = ?")
            .bind(info_hash.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records history; an existing metainfo blob is kept when `record`
    /// carries none.
    pub async fn save_history(&self, record: &HistoryRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO torrent_history (infohash, name, added_at, metainfo_blob)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (infohash) DO UPDATE SET
                name = excluded.name,
                metainfo_blob = COALESCE(excluded.metainfo_blob, torrent_history.metainfo_blob)",
        )
        .bind(record.info_hash.to_string())
        .bind(&record.name)
        .bind(record.added_at.timestamp())
        .bind(record.metainfo.clone())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn history(&self, info_hash: InfoHash) -> Result<Option<HistoryRecord>, PersistenceError> {
        let row = sqlx::query("SELECT * FROM torrent_history WHERE infohash = ?")
            .bind(info_hash.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let added_at: i64 = row.try_get("added_at")?;
        Ok(Some(HistoryRecord {
            info_hash: parse_info_hash(&row)?,
            name: row.try_get("name")?,
            added_at: DateTime::from_timestamp(added_at, 0).unwrap_or_default(),
            metainfo: row.try_get("metainfo_blob")?,
        }))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Opens a pool on `path`; read-only pools never create the file.
pub(crate) async fn connect(path: &Path, read_only: bool) -> Result<SqlitePool, PersistenceError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(!read_only)
        .read_only(read_only)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|source| PersistenceError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn parse_info_hash(row: &SqliteRow) -> Result<InfoHash, PersistenceError> {
    let value: String = row.try_get("infohash")?;
    InfoHash::from_hex(&value).map_err(|e| PersistenceError::Decode {
        reason: format!("infohash {value}: {e}"),
    })
}

fn item_from_row(row: &SqliteRow) -> Result<TorrentItem, PersistenceError> {
    let state: String = row.try_get("state")?;
    let media_type: String = row.try_get("media_type")?;
    let files: String = row.try_get("files")?;
    let context: String = row.try_get("context")?;
    Ok(TorrentItem {
        info_hash: parse_info_hash(row)?,
        state: TorrentItemState::parse(&state).ok_or_else(|| PersistenceError::Decode {
            reason: format!("unknown item state {state}"),
        })?,
        media_id: row.try_get("media_id")?,
        media_type: MediaType::parse(&media_type),
        files: serde_json::from_str(&files).map_err(PersistenceError::decode)?,
        context: serde_json::from_str::<MediaContext>(&context).map_err(PersistenceError::decode)?,
    })
}
