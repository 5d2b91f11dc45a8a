//! Swarm engine abstraction.
//!
//! The service drives a BitTorrent engine only through [`SwarmEngine`]. Two
//! backends implement it: [`WireEngine`] speaks the real protocol over TCP
//! with HTTP and UDP trackers, and [`SimulatedEngine`] serves deterministic
//! content for development and tests. Engines report progress through an
//! unbounded channel of [`EngineEvent`]s handed to them at construction.

pub mod priority;
pub mod simulated;
pub mod wire;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

pub use priority::PriorityMap;
pub use simulated::{SimulatedEngine, SimulationProfile};
pub use wire::WireEngine;

use crate::config::NetworkConfig;
use crate::error::ErrorKind;
use crate::storage::{PieceState, PieceStore, StoreError};
use crate::torrent::{InfoHash, Metainfo, Priority, TorrentSource};

/// Sender half engines use to report progress.
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
/// Receiver half consumed by the service.
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Creates the event channel connecting an engine to the service.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Notifications from the engine to the service.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MetadataReceived {
        info_hash: InfoHash,
        metainfo: Arc<Metainfo>,
    },
    PieceCompleted {
        info_hash: InfoHash,
        piece: u32,
    },
    PieceHashFailed {
        info_hash: InfoHash,
        piece: u32,
    },
    /// Every piece of the torrent has been verified once
    TorrentFinished { info_hash: InfoHash },
    TrackerError {
        info_hash: InfoHash,
        url: String,
        message: String,
    },
    /// Payload could not be written; the torrent cannot make progress
    StorageFailed { info_hash: InfoHash, message: String },
}

impl EngineEvent {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            EngineEvent::MetadataReceived { info_hash, .. }
            | EngineEvent::PieceCompleted { info_hash, .. }
            | EngineEvent::PieceHashFailed { info_hash, .. }
            | EngineEvent::TorrentFinished { info_hash }
            | EngineEvent::TrackerError { info_hash, .. }
            | EngineEvent::StorageFailed { info_hash, .. } => *info_hash,
        }
    }
}

/// Lifecycle of the engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Reconfiguring,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Reconfiguring => "reconfiguring",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        }
    }

    /// Whether torrents may be added or driven.
    pub fn accepts_work(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Reconfiguring)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared session-state cell used by engine backends.
#[derive(Debug)]
pub struct SessionLifecycle {
    state: Mutex<SessionState>,
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(SessionState::Starting),
        }
    }
}

impl SessionLifecycle {
    pub fn get(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(from = %*current, to = %state, "Session state changed");
            *current = state;
        }
    }

    /// Errors unless the session is accepting work.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotRunning` - Session is starting, stopping or stopped
    pub fn ensure_running(&self) -> Result<(), EngineError> {
        let state = self.get();
        if state.accepts_work() {
            Ok(())
        } else {
            Err(EngineError::NotRunning { state })
        }
    }
}

/// Per-torrent swarm statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SwarmStats {
    /// Bytes per second
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peers: usize,
    pub downloaded: u64,
    pub uploaded: u64,
}

/// Errors reported by engine backends.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Torrent not found in session: {info_hash}")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Session is {state}")]
    NotRunning { state: SessionState },

    #[error("Metadata not yet available for {info_hash}")]
    MetadataPending { info_hash: InfoHash },

    #[error("Tracker {url} failed: {reason}")]
    Tracker { url: String, reason: String },

    #[error("Peer protocol error: {message}")]
    Protocol { message: String },

    #[error("Network I/O error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::TorrentNotFound { .. } => ErrorKind::NotFound,
            EngineError::NotRunning { .. } => ErrorKind::Shutdown,
            EngineError::MetadataPending { .. } => ErrorKind::MetadataPending,
            EngineError::Store(e) => e.kind(),
            _ => ErrorKind::Internal,
        }
    }
}

/// Operations the service drives on a BitTorrent engine.
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Adds a torrent. Bare sources trigger a metadata fetch that ends in
    /// [`EngineEvent::MetadataReceived`]; sources carrying metainfo emit it
    /// immediately. Adding an existing infohash is a no-op.
    async fn add_torrent(&self, source: TorrentSource) -> Result<(), EngineError>;

    /// Connects the torrent to the store its blocks are written into.
    async fn attach_storage(&self, info_hash: InfoHash, store: Arc<PieceStore>) -> Result<(), EngineError>;

    async fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), EngineError>;

    async fn set_piece_priority(&self, info_hash: InfoHash, piece: u32, priority: Priority) -> Result<(), EngineError>;

    async fn set_piece_deadline(&self, info_hash: InfoHash, piece: u32, deadline: Duration) -> Result<(), EngineError>;

    /// Replaces the whole priority assignment in one batch.
    async fn apply_priorities(&self, info_hash: InfoHash, map: PriorityMap) -> Result<(), EngineError>;

    async fn piece_state(&self, info_hash: InfoHash, piece: u32) -> Result<PieceState, EngineError>;

    async fn stats(&self, info_hash: InfoHash) -> Result<SwarmStats, EngineError>;

    /// Applies new rate limits and listen settings. Torrents survive.
    async fn reconfigure(&self, config: &NetworkConfig) -> Result<(), EngineError>;

    fn state(&self) -> SessionState;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    async fn shutdown(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_gates_work() {
        let lifecycle = SessionLifecycle::default();
        assert!(matches!(
            lifecycle.ensure_running(),
            Err(EngineError::NotRunning {
                state: SessionState::Starting
            })
        ));
        lifecycle.set(SessionState::Running);
        assert!(lifecycle.ensure_running().is_ok());
        lifecycle.set(SessionState::Reconfiguring);
        assert!(lifecycle.ensure_running().is_ok());
        lifecycle.set(SessionState::Stopped);
        assert_eq!(lifecycle.ensure_running().unwrap_err().kind(), ErrorKind::Shutdown);
    }
}
