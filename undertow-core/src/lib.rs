//! Undertow Core - torrent session core for media streaming
//!
//! Turns a torrent reference into seekable byte streams: piece storage with
//! bounded retention, a swarm engine abstraction with native and simulated
//! backends, per-reader window prioritization, blocking readers, and the
//! supervising service with its reaper and persistence.

pub mod config;
pub mod context;
pub mod error;
pub mod persistence;
pub mod profile;
pub mod service;
pub mod session;
pub mod storage;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{ConfigError, ConfigSource, UndertowConfig};
pub use context::Context;
pub use error::ErrorKind;
pub use persistence::PersistenceError;
pub use profile::{InstanceLock, LockError, Profile};
pub use service::{Service, ServiceError};
pub use session::{EngineError, SwarmEngine};
pub use storage::{PieceStore, StoreError};
pub use streaming::{ReadError, Reader};
pub use torrent::{InfoHash, MetainfoError, TorrentError};

/// Errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Lockfile error: {0}")]
    Lock(#[from] LockError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UndertowError::Config(e) => e.kind(),
            UndertowError::Persistence(e) => e.kind(),
            UndertowError::Lock(_) | UndertowError::Io(_) => ErrorKind::Internal,
            UndertowError::Service(e) => e.kind(),
            UndertowError::Torrent(e) => e.kind(),
            UndertowError::Metainfo(e) => e.kind(),
            UndertowError::Engine(e) => e.kind(),
            UndertowError::Store(e) => e.kind(),
            UndertowError::Read(e) => e.kind(),
        }
    }

    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::InvalidRef => "That is not a magnet link, infohash or torrent file".to_string(),
            ErrorKind::NotFound => "Torrent not found".to_string(),
            ErrorKind::MetadataPending => "Still fetching torrent information".to_string(),
            ErrorKind::MetadataTimeout => "Could not fetch torrent information in time".to_string(),
            ErrorKind::StorageFull => "Not enough disk space for the download".to_string(),
            ErrorKind::Stalled => "Download is stalled".to_string(),
            ErrorKind::PersistenceFailure => "Database error occurred".to_string(),
            ErrorKind::ConfigurationError => format!("Configuration problem: {self}"),
            ErrorKind::Shutdown => "Undertow is shutting down".to_string(),
            _ => "Streaming error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidRef | ErrorKind::NotFound | ErrorKind::InvalidRange | ErrorKind::ConfigurationError
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let invalid: UndertowError = MetainfoError::InvalidRef {
            input: "nope".to_string(),
        }
        .into();
        assert_eq!(invalid.kind(), ErrorKind::InvalidRef);
        assert!(invalid.is_user_error());

        let full: UndertowError = StoreError::StorageFull {
            message: "disk full".to_string(),
        }
        .into();
        assert_eq!(full.kind(), ErrorKind::StorageFull);
        assert!(!full.is_user_error());
        assert_eq!(full.user_message(), "Not enough disk space for the download");
    }
}
