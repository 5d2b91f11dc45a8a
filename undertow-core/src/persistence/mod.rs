//! sqlite-backed persistence: the relational `app.db`, the `cache.db`
//! key/value store, backup rotation and the legacy library import.
//!
//! Adapters hand out owned values only; nothing outside this module holds
//! rows or connections.

pub mod backup;
pub mod database;
pub mod kv;
pub mod legacy;

use std::path::PathBuf;

pub use backup::{backup_path, open_with_restore};
pub use database::{AppDatabase, HistoryRecord, SCHEMA_VERSION};
pub use kv::KvStore;
pub use legacy::import_legacy;

use crate::error::ErrorKind;

/// Errors from the relational and key/value stores.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to open database {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration {version} failed")]
    Migration {
        version: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database query failed")]
    Query(#[from] sqlx::Error),

    #[error("Stored value could not be decoded: {reason}")]
    Decode { reason: String },

    #[error("Value could not be encoded: {reason}")]
    Encode { reason: String },

    #[error("Backup I/O error")]
    Io(#[from] std::io::Error),
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PersistenceFailure
    }

    pub(crate) fn decode(error: serde_json::Error) -> Self {
        PersistenceError::Decode {
            reason: error.to_string(),
        }
    }

    pub(crate) fn encode(error: serde_json::Error) -> Self {
        PersistenceError::Encode {
            reason: error.to_string(),
        }
    }
}

impl AppDatabase {
    /// Rotates `app-backup.db`.
    ///
    /// # Errors
    ///
    /// - `PersistenceError` - Snapshot could not be written
    pub async fn backup(&self) -> Result<PathBuf, PersistenceError> {
        backup::snapshot(self.pool(), self.path()).await
    }
}

impl KvStore {
    /// Rotates `cache-backup.db`.
    ///
    /// # Errors
    ///
    /// - `PersistenceError` - Snapshot could not be written
    pub async fn backup(&self) -> Result<PathBuf, PersistenceError> {
        backup::snapshot(self.pool(), self.path()).await
    }
}
