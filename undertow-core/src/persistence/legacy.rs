//! One-shot import of torrent items from a legacy `library.db`.
//!
//! The legacy file is a key/value table `kv(bucket, key, value)` whose
//! `torrents` bucket maps infohashes to JSON item records. It is opened
//! read-only and never written.

use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use sqlx::Row;

use super::PersistenceError;
use super::database::{AppDatabase, connect};
use crate::torrent::{InfoHash, MediaContext, MediaType, TorrentItem, TorrentItemState};

/// Settings row recording that the import ran.
pub const IMPORT_SETTING: &str = "legacy_library_import";
const TORRENTS_BUCKET: &str = "torrents";

#[derive(Debug, Deserialize)]
struct LegacyItem {
    #[serde(default)]
    media_id: i64,
    #[serde(default)]
    media_type: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    removed: bool,
}

/// Copies legacy items that `database` does not know yet. Runs at most
/// once per profile; returns the number of items imported.
///
/// # Errors
///
/// - `PersistenceError::Open` - Legacy file exists but cannot be read
/// - `PersistenceError::Query` - Reading or writing rows failed
pub async fn import_legacy(database: &AppDatabase, legacy: &Path) -> Result<usize, PersistenceError> {
    if !legacy.exists() || database.setting(IMPORT_SETTING).await?.is_some() {
        return Ok(0);
    }
    let pool = connect(legacy, true).await?;
    let rows = sqlx::query("SELECT key, value FROM kv WHERE bucket = ?")
        .bind(TORRENTS_BUCKET)
        .fetch_all(&pool)
        .await;
    pool.close().await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(path = %legacy.display(), "Legacy library unreadable, skipping import: {e}");
            Vec::new()
        }
    };

    let mut imported = 0;
    for row in rows {
        let key: String = row.try_get("key")?;
        let value: Vec<u8> = row.try_get("value")?;
        let Ok(info_hash) = InfoHash::from_hex(&key) else {
            tracing::debug!(key, "Skipping legacy entry with invalid infohash");
            continue;
        };
        let legacy_item: LegacyItem = match serde_json::from_slice(&value) {
            Ok(item) => item,
            Err(e) => {
                tracing::debug!(key, "Skipping undecodable legacy entry: {e}");
                continue;
            }
        };
        if database.item(info_hash).await?.is_some() {
            continue;
        }
        let media_type = MediaType::parse(&legacy_item.media_type);
        let context = MediaContext {
            media_type,
            media_id: legacy_item.media_id,
            ..MediaContext::default()
        };
        let mut item = TorrentItem::new(info_hash, context);
        item.files = legacy_item.files;
        if legacy_item.removed {
            item.state = TorrentItemState::Removed;
        }
        database.save_item(&item).await?;
        imported += 1;
    }

    database
        .set_setting(IMPORT_SETTING, &Utc::now().to_rfc3339())
        .await?;
    tracing::info!(imported, path = %legacy.display(), "Legacy library imported");
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn legacy_file(path: &Path, entries: &[(&str, &str)]) {
        let pool = connect(path, false).await.unwrap();
        sqlx::query("CREATE TABLE kv (bucket TEXT, key TEXT, value BLOB)")
            .execute(&pool)
            .await
            .unwrap();
        for (key, value) in entries {
            sqlx::query("INSERT INTO kv (bucket, key, value) VALUES ('torrents', ?, ?)")
                .bind(*key)
                .bind(value.as_bytes())
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn test_import_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("library.db");
        let hash = "0123456789abcdef0123456789abcdef01234567";
        legacy_file(
            &legacy,
            &[
                (hash, r#"{"media_id": 5, "media_type": "movie", "files": ["a.mkv"]}"#),
                ("not-a-hash", "{}"),
                ("89abcdef0123456789abcdef0123456789abcdef", "not json"),
            ],
        )
        .await;

        let db = AppDatabase::open(&dir.path().join("app.db")).await.unwrap();
        assert_eq!(import_legacy(&db, &legacy).await.unwrap(), 1);
        let item = db.item(InfoHash::from_hex(hash).unwrap()).await.unwrap().unwrap();
        assert_eq!(item.media_id, 5);
        assert_eq!(item.media_type, MediaType::Movie);
        assert_eq!(item.files, vec!["a.mkv".to_string()]);
        assert!(item.is_active());

        assert_eq!(import_legacy(&db, &legacy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_legacy_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db = AppDatabase::open(&dir.path().join("app.db")).await.unwrap();
        assert_eq!(import_legacy(&db, &dir.path().join("library.db")).await.unwrap(), 0);
        assert!(db.setting(IMPORT_SETTING).await.unwrap().is_none());
    }
}
