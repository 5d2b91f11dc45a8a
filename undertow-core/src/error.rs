//! Stable, machine-readable error kinds shared by every subsystem.
//!
//! Each subsystem keeps its own `thiserror` enum; `kind()` on those enums
//! collapses them onto [`ErrorKind`] so that outer surfaces (HTTP, CLI) can
//! map failures without matching on subsystem internals.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input could not be parsed as a torrent reference.
    InvalidRef,
    /// Unknown torrent id or file index.
    NotFound,
    /// Metainfo has not arrived yet; caller should retry.
    MetadataPending,
    /// Metainfo was not obtained within the configured budget.
    MetadataTimeout,
    /// A piece failed its SHA-1 check.
    PieceHashMismatch,
    /// Head window cannot progress.
    Stalled,
    /// Disk write failure on file-backed storage.
    StorageFull,
    /// Memory store could not admit a block.
    EvictionRefused,
    /// The requesting scope went away.
    ReaderCancelled,
    /// The service is stopping.
    Shutdown,
    /// Relational or key/value store failure.
    PersistenceFailure,
    /// Configuration could not be loaded or validated.
    ConfigurationError,
    /// Requested byte range cannot be satisfied.
    InvalidRange,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Snake-case code used in JSON bodies and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRef => "invalid_ref",
            ErrorKind::NotFound => "not_found",
            ErrorKind::MetadataPending => "metadata_pending",
            ErrorKind::MetadataTimeout => "metadata_timeout",
            ErrorKind::PieceHashMismatch => "piece_hash_mismatch",
            ErrorKind::Stalled => "stalled",
            ErrorKind::StorageFull => "storage_full",
            ErrorKind::EvictionRefused => "eviction_refused",
            ErrorKind::ReaderCancelled => "reader_cancelled",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::PersistenceFailure => "persistence_failure",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::InvalidRange => "invalid_range",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_as_code() {
        let json = serde_json::to_string(&ErrorKind::MetadataTimeout).unwrap();
        assert_eq!(json, "\"metadata_timeout\"");
        assert_eq!(ErrorKind::StorageFull.to_string(), "storage_full");
    }
}
