//! Backup rotation and restore of the sqlite files.
//!
//! A backup is written with `VACUUM INTO` to a temporary file beside the
//! database and renamed over `<stem>-backup.<ext>`, so a crash mid-backup
//! never leaves a torn snapshot behind.

use std::future::Future;
use std::path::{Path, PathBuf};

use sqlx::sqlite::SqlitePool;

use super::PersistenceError;

/// `app.db` -> `app-backup.db`.
pub fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-backup.{}", ext.to_string_lossy()),
        None => format!("{stem}-backup"),
    };
    path.with_file_name(name)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes a consistent copy of the database behind `pool`.
///
/// # Errors
///
/// - `PersistenceError::Query` - `VACUUM INTO` failed
/// - `PersistenceError::Io` - The snapshot could not be moved into place
pub async fn snapshot(pool: &SqlitePool, path: &Path) -> Result<PathBuf, PersistenceError> {
    let target = backup_path(path);
    let staging = sidecar(&target, ".tmp");
    match tokio::fs::remove_file(&staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    sqlx::query("VACUUM INTO ?")
        .bind(staging.to_string_lossy().into_owned())
        .execute(pool)
        .await?;
    tokio::fs::rename(&staging, &target).await?;
    tracing::debug!(path = %target.display(), "Database backup written");
    Ok(target)
}

/// Replaces `path` with its backup. The unreadable file is kept beside it
/// with a `.corrupt` suffix. Returns false when no backup exists.
///
/// # Errors
///
/// - `PersistenceError::Io` - Files could not be moved or copied
pub fn restore(path: &Path) -> Result<bool, PersistenceError> {
    let backup = backup_path(path);
    if !backup.exists() {
        return Ok(false);
    }
    if path.exists() {
        std::fs::rename(path, sidecar(path, ".corrupt"))?;
    }
    for suffix in ["-wal", "-shm", "-journal"] {
        match std::fs::remove_file(sidecar(path, suffix)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    std::fs::copy(&backup, path)?;
    tracing::warn!(path = %path.display(), backup = %backup.display(), "Database restored from backup");
    Ok(true)
}

/// Runs `open`; when it fails, restores the backup and tries once more.
///
/// # Errors
///
/// - `PersistenceError` - Opening failed and no usable backup exists
pub async fn open_with_restore<T, F, Fut>(path: &Path, open: F) -> Result<T, PersistenceError>
where
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = Result<T, PersistenceError>>,
{
    match open(path.to_path_buf()).await {
        Ok(handle) => Ok(handle),
        Err(first) => {
            tracing::error!(path = %path.display(), "Database failed to open: {first}");
            if !restore(path)? {
                return Err(first);
            }
            open(path.to_path_buf()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{AppDatabase, KvStore};

    #[test]
    fn test_backup_path_naming() {
        assert_eq!(backup_path(Path::new("/p/app.db")), PathBuf::from("/p/app-backup.db"));
        assert_eq!(backup_path(Path::new("/p/cache")), PathBuf::from("/p/cache-backup"));
    }

    #[tokio::test]
    async fn test_corrupt_database_is_restored_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let db = AppDatabase::open(&path).await.unwrap();
        db.set_setting("marker", "kept").await.unwrap();
        snapshot(db.pool(), &path).await.unwrap();
        db.close().await;

        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        assert!(AppDatabase::open(&path).await.is_err());

        let db = open_with_restore(&path, |p| async move { AppDatabase::open(&p).await })
            .await
            .unwrap();
        assert_eq!(db.setting("marker").await.unwrap().as_deref(), Some("kept"));
        assert!(dir.path().join("app.db.corrupt").exists());
    }

    #[tokio::test]
    async fn test_missing_backup_surfaces_original_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        let result = open_with_restore(&path, |p| async move { KvStore::open(&p).await }).await;
        assert!(result.is_err());
    }
}
