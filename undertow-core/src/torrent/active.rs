//! A torrent under management: lifecycle, playback file and readers.
//!
//! [`Torrent`] owns the buffer controller and the piece store once metadata
//! is known, and turns engine notifications into lifecycle transitions.
//! Priority changes are computed synchronously and handed to a per-torrent
//! task that applies the newest batch to the engine, so seeking never waits
//! on the engine.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::item::MediaContext;
use super::layout::FileEntry;
use super::metainfo::Metainfo;
use super::state::{InvalidTransition, TorrentState};
use super::{InfoHash, PieceRange};
use crate::config::{BufferConfig, StoragePolicyKind, UndertowConfig};
use crate::error::ErrorKind;
use crate::session::{EngineError, PriorityMap, SwarmEngine, SwarmStats};
use crate::storage::{PieceStore, StoreError};
use crate::streaming::{BufferController, ReaderId, Reader};

/// Per-torrent tuning derived from the service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentSettings {
    pub buffer: BufferConfig,
    /// File stores above this size are swept outside the windows
    pub file_watermark: u64,
    /// Pieces kept around each window when sweeping
    pub padding_pieces: u32,
}

impl TorrentSettings {
    pub fn from_config(config: &UndertowConfig) -> Self {
        Self {
            buffer: config.buffer.clone(),
            file_watermark: config.storage.file_watermark,
            padding_pieces: config.storage.padding_pieces,
        }
    }
}

/// Errors from torrent-level operations.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Metadata for {info_hash} not yet received")]
    MetadataPending { info_hash: InfoHash },

    #[error("Torrent {info_hash} has no file {index}")]
    NoSuchFile { info_hash: InfoHash, index: usize },

    #[error("Torrent {info_hash} is being removed")]
    Removed { info_hash: InfoHash },

    #[error("Torrent {info_hash} failed: {detail}")]
    Failed {
        info_hash: InfoHash,
        kind: ErrorKind,
        detail: String,
    },

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TorrentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::MetadataPending { .. } => ErrorKind::MetadataPending,
            TorrentError::NoSuchFile { .. } | TorrentError::Removed { .. } => ErrorKind::NotFound,
            TorrentError::Failed { kind, .. } => *kind,
            TorrentError::Transition(_) => ErrorKind::Internal,
            TorrentError::Engine(e) => e.kind(),
            TorrentError::Store(e) => e.kind(),
        }
    }
}

/// File chosen for playback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedFile {
    pub index: usize,
    pub path: String,
    pub length: u64,
}

/// Point-in-time view of a torrent for listings.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentSnapshot {
    pub id: InfoHash,
    pub name: String,
    pub state: TorrentState,
    /// Percent of the playback file downloaded, 0 to 100
    pub progress: f64,
    pub size: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peers: usize,
    pub readers: usize,
    pub stalled: bool,
    pub selected_file: Option<SelectedFile>,
    pub error: Option<ErrorKind>,
    pub added_at: DateTime<Utc>,
    pub context: MediaContext,
}

struct Inner {
    name: String,
    context: MediaContext,
    settings: TorrentSettings,
    metainfo: Option<Arc<Metainfo>>,
    store: Option<Arc<PieceStore>>,
    selected: Option<usize>,
    buffer: Option<BufferController>,
    failure: Option<(ErrorKind, String)>,
    idle_since: Instant,
    finished_at: Option<Instant>,
}

/// One managed torrent.
pub struct Torrent {
    info_hash: InfoHash,
    added_at: DateTime<Utc>,
    engine: Arc<dyn SwarmEngine>,
    state: watch::Sender<TorrentState>,
    inner: Mutex<Inner>,
    batches: watch::Sender<Option<PriorityMap>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Torrent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Torrent")
            .field("info_hash", &self.info_hash)
            .field("state", &*self.state.borrow())
            .field("engine", &self.engine.name())
            .finish_non_exhaustive()
    }
}

impl Torrent {
    /// Creates a torrent waiting for metadata. Must be called inside a tokio
    /// runtime; spawns the task feeding priority batches to `engine`.
    pub fn new(
        info_hash: InfoHash,
        name: Option<String>,
        context: MediaContext,
        engine: Arc<dyn SwarmEngine>,
        settings: TorrentSettings,
    ) -> Arc<Self> {
        let (batches, batches_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        tokio::spawn(push_priorities(
            Arc::clone(&engine),
            info_hash,
            batches_rx,
            cancel.clone(),
        ));
        Arc::new(Self {
            info_hash,
            added_at: Utc::now(),
            engine,
            state: watch::channel(TorrentState::MetadataPending).0,
            inner: Mutex::new(Inner {
                name: name.unwrap_or_else(|| info_hash.to_string()),
                context,
                settings,
                metainfo: None,
                store: None,
                selected: None,
                buffer: None,
                failure: None,
                idle_since: Instant::now(),
                finished_at: None,
            }),
            batches,
            cancel,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn state(&self) -> TorrentState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TorrentState> {
        self.state.subscribe()
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn context(&self) -> MediaContext {
        self.inner.lock().context.clone()
    }

    pub fn metainfo(&self) -> Option<Arc<Metainfo>> {
        self.inner.lock().metainfo.clone()
    }

    pub fn store(&self) -> Option<Arc<PieceStore>> {
        self.inner.lock().store.clone()
    }

    /// Current playback file.
    pub fn selected_file(&self) -> Option<FileEntry> {
        let inner = self.inner.lock();
        let metainfo = inner.metainfo.as_ref()?;
        metainfo.files.get(inner.selected?).cloned()
    }

    pub fn failure(&self) -> Option<(ErrorKind, String)> {
        self.inner.lock().failure.clone()
    }

    pub fn reader_count(&self) -> usize {
        self.inner
            .lock()
            .buffer
            .as_ref()
            .map_or(0, BufferController::reader_count)
    }

    /// How long no reader has been attached; `None` while one is.
    pub fn idle_for(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        let readers = inner.buffer.as_ref().map_or(0, BufferController::reader_count);
        (readers == 0).then(|| inner.idle_since.elapsed())
    }

    /// Time since the playback file completed.
    pub fn finished_for(&self) -> Option<Duration> {
        self.inner.lock().finished_at.map(|at| at.elapsed())
    }

    pub fn is_stalled(&self) -> bool {
        self.inner
            .lock()
            .buffer
            .as_ref()
            .is_some_and(BufferController::is_stalled)
    }

    /// Priority assignment the torrent currently wants.
    pub fn priority_map(&self) -> Option<PriorityMap> {
        self.inner.lock().buffer.as_ref().map(BufferController::compute_map)
    }

    /// Head and tail windows currently protected.
    pub fn windows(&self) -> Vec<PieceRange> {
        self.inner
            .lock()
            .buffer
            .as_ref()
            .map(BufferController::windows)
            .unwrap_or_default()
    }

    /// Installs metadata and storage, selects the playback file and arms
    /// the windows. Moves the torrent to buffering.
    ///
    /// # Errors
    ///
    /// - `TorrentError::NoSuchFile` - `file_index` outside the file list
    /// - `TorrentError::Transition` - Torrent is no longer waiting for metadata
    /// - `TorrentError::Engine` - Engine refused the store
    pub async fn activate(
        &self,
        metainfo: Arc<Metainfo>,
        store: Arc<PieceStore>,
        file_index: usize,
    ) -> Result<(), TorrentError> {
        let Some(file) = metainfo.files.get(file_index).cloned() else {
            return Err(TorrentError::NoSuchFile {
                info_hash: self.info_hash,
                index: file_index,
            });
        };
        self.state().transition(TorrentState::Buffering)?;
        self.engine
            .attach_storage(self.info_hash, Arc::clone(&store))
            .await?;

        {
            let mut inner = self.inner.lock();
            let next = self.state().transition(TorrentState::Buffering)?;
            let buffer = BufferController::new(
                &inner.settings.buffer,
                metainfo.piece_length,
                metainfo.piece_count(),
                &file,
                store.capacity(),
            );
            inner.name = metainfo.name.clone();
            inner.metainfo = Some(Arc::clone(&metainfo));
            inner.store = Some(store);
            inner.selected = Some(file_index);
            inner.buffer = Some(buffer);
            self.set_state(next);
        }
        tracing::info!(
            info_hash = %self.info_hash,
            file = %file.display_path(),
            size = file.length,
            "Playback file selected"
        );
        self.reconcile();
        self.advance_playback();
        Ok(())
    }

    /// Switches the playback file; the tail window moves to its end.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataPending` - No metadata yet
    /// - `TorrentError::NoSuchFile` - `index` outside the file list
    pub fn select_file(&self, index: usize) -> Result<FileEntry, TorrentError> {
        let file = {
            let mut inner = self.inner.lock();
            let (Some(metainfo), Some(store)) = (inner.metainfo.clone(), inner.store.clone()) else {
                return Err(TorrentError::MetadataPending {
                    info_hash: self.info_hash,
                });
            };
            let file = metainfo
                .files
                .get(index)
                .cloned()
                .ok_or(TorrentError::NoSuchFile {
                    info_hash: self.info_hash,
                    index,
                })?;
            if inner.selected == Some(index) {
                return Ok(file);
            }
            inner.selected = Some(index);
            inner.finished_at = None;
            if let Some(buffer) = inner.buffer.as_mut() {
                buffer.set_playback(&file, store.capacity());
            }
            file
        };
        tracing::info!(info_hash = %self.info_hash, file = %file.display_path(), "Playback file changed");
        self.reconcile();
        self.advance_playback();
        Ok(file)
    }

    /// Opens a reader on `file_index`, or on the playback file when `None`.
    /// A different explicit index becomes the new playback file.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataPending` - No metadata yet
    /// - `TorrentError::NoSuchFile` - Index outside the file list
    /// - `TorrentError::Failed` - Torrent is in the error state
    /// - `TorrentError::Removed` - Torrent is being reaped
    pub fn attach_reader(
        self: &Arc<Self>,
        file_index: Option<usize>,
        cancel: CancellationToken,
    ) -> Result<Reader, TorrentError> {
        self.check_usable()?;
        let selected = {
            let inner = self.inner.lock();
            if inner.metainfo.is_none() {
                return Err(TorrentError::MetadataPending {
                    info_hash: self.info_hash,
                });
            }
            inner.selected.unwrap_or(0)
        };
        let file = self.select_file(file_index.unwrap_or(selected))?;

        let id: ReaderId = Uuid::new_v4();
        let store = {
            let mut inner = self.inner.lock();
            let Some(store) = inner.store.clone() else {
                return Err(TorrentError::MetadataPending {
                    info_hash: self.info_hash,
                });
            };
            if let Some(buffer) = inner.buffer.as_mut() {
                buffer.attach(id, &file, 0);
            }
            store
        };
        tracing::debug!(info_hash = %self.info_hash, reader = %id, file = file.index, "Reader attached");
        self.reconcile();
        Ok(Reader::new(id, Arc::clone(self), store, file, cancel))
    }

    fn check_usable(&self) -> Result<(), TorrentError> {
        if let Some((kind, detail)) = self.failure() {
            return Err(TorrentError::Failed {
                info_hash: self.info_hash,
                kind,
                detail,
            });
        }
        if self.state().is_terminal() {
            return Err(TorrentError::Removed {
                info_hash: self.info_hash,
            });
        }
        Ok(())
    }

    /// Reader moved to file offset `offset`.
    pub(crate) fn reader_moved(&self, id: ReaderId, offset: u64, seek: bool) {
        let moved = {
            let mut inner = self.inner.lock();
            match inner.buffer.as_mut() {
                Some(buffer) if seek => buffer.seek(id, offset),
                Some(buffer) => buffer.advance(id, offset),
                None => false,
            }
        };
        if moved {
            self.reconcile();
            if seek {
                self.sweep_outside_windows();
            }
        }
    }

    pub(crate) fn detach_reader(&self, id: ReaderId) {
        let detached = {
            let mut inner = self.inner.lock();
            let detached = inner.buffer.as_mut().is_some_and(|buffer| buffer.detach(id));
            if detached && inner.buffer.as_ref().map_or(0, BufferController::reader_count) == 0 {
                inner.idle_since = Instant::now();
            }
            detached
        };
        if detached {
            tracing::debug!(info_hash = %self.info_hash, reader = %id, "Reader detached");
            self.reconcile();
        }
    }

    /// Buffering gate of a reader's first read.
    pub(crate) fn is_buffered_for(&self, id: ReaderId) -> bool {
        let inner = self.inner.lock();
        match (inner.buffer.as_ref(), inner.store.as_ref()) {
            (Some(buffer), Some(store)) => buffer.is_buffered(id, store),
            _ => false,
        }
    }

    /// Recomputes priorities and protection and queues the batch for the
    /// engine. Superseded batches are never applied.
    pub fn reconcile(&self) {
        let map = {
            let inner = self.inner.lock();
            let (Some(buffer), Some(store)) = (inner.buffer.as_ref(), inner.store.as_ref()) else {
                return;
            };
            if self.state().is_terminal() {
                return;
            }
            store.set_protected(buffer.windows());
            buffer.compute_map()
        };
        self.batches.send_replace(Some(map));
    }

    /// Engine verified `piece`.
    pub fn on_piece_complete(&self, piece: u32) {
        let touches_head = {
            let mut inner = self.inner.lock();
            let Some(buffer) = inner.buffer.as_mut() else {
                return;
            };
            buffer.on_piece_complete(piece)
        };
        self.sweep_outside_windows();
        self.advance_playback();
        if touches_head {
            self.reconcile();
        }
    }

    /// Releases file-store pieces outside the padded windows once the torrent
    /// is above the watermark. The sweep runs on the blocking pool with a
    /// snapshot of the windows.
    fn sweep_outside_windows(&self) {
        let Some((store, keep, watermark)) = self.sweep_plan() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn_blocking(move || store.sweep(&keep, watermark));
        }
    }

    fn sweep_plan(&self) -> Option<(Arc<PieceStore>, Vec<PieceRange>, u64)> {
        let inner = self.inner.lock();
        let store = inner
            .store
            .clone()
            .filter(|store| store.policy() == StoragePolicyKind::File)?;
        let watermark = inner.settings.file_watermark;
        if store.total_length() <= watermark {
            return None;
        }
        let padding = inner.settings.padding_pieces;
        let keep = inner
            .buffer
            .as_ref()?
            .windows()
            .into_iter()
            .map(|range| range.widen(padding, store.piece_count()))
            .collect();
        Some((store, keep, watermark))
    }

    /// Engine rejected `piece` on hash check. Returns true when the torrent
    /// just escalated to stalled.
    pub fn on_hash_failure(&self, piece: u32) -> bool {
        let stalled = {
            let mut inner = self.inner.lock();
            inner
                .buffer
                .as_mut()
                .is_some_and(|buffer| buffer.on_hash_failure(piece))
        };
        if stalled {
            tracing::warn!(info_hash = %self.info_hash, piece, "Piece keeps failing verification, stalled");
            self.reconcile();
        }
        stalled
    }

    /// Buffering becomes playing once the windows are verified; any live
    /// state becomes finished once the playback file is complete.
    fn advance_playback(&self) {
        let inner = self.inner.lock();
        let (Some(buffer), Some(store)) = (inner.buffer.as_ref(), inner.store.as_ref()) else {
            return;
        };
        let mut state = self.state();
        if state == TorrentState::Buffering && buffer.is_complete(store) {
            self.set_state(TorrentState::Playing);
            state = TorrentState::Playing;
        }
        let complete = store.all_downloaded(buffer.playback_pieces());
        drop(inner);
        if complete && state.can_transition(TorrentState::Finished) {
            self.inner.lock().finished_at = Some(Instant::now());
            self.set_state(TorrentState::Finished);
        }
    }

    /// Drops every priority to skipped except the heads, kept at normal.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataPending` - No metadata yet
    /// - `TorrentError::Transition` - Torrent is finished, failed or reaping
    pub fn pause(&self) -> Result<(), TorrentError> {
        {
            let mut inner = self.inner.lock();
            let state = self.state();
            if state == TorrentState::MetadataPending {
                return Err(TorrentError::MetadataPending {
                    info_hash: self.info_hash,
                });
            }
            if state == TorrentState::Paused {
                return Ok(());
            }
            let next = state.transition(TorrentState::Paused)?;
            if let Some(buffer) = inner.buffer.as_mut() {
                buffer.set_paused(true);
            }
            self.set_state(next);
        }
        self.reconcile();
        Ok(())
    }

    /// Restores window priorities after a pause.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataPending` - No metadata yet
    /// - `TorrentError::Transition` - Torrent is failed or reaping
    pub fn resume(&self) -> Result<(), TorrentError> {
        {
            let mut inner = self.inner.lock();
            let state = self.state();
            match state {
                TorrentState::MetadataPending => {
                    return Err(TorrentError::MetadataPending {
                        info_hash: self.info_hash,
                    });
                }
                TorrentState::Buffering | TorrentState::Playing | TorrentState::Finished => return Ok(()),
                _ => {}
            }
            let buffered = match (inner.buffer.as_ref(), inner.store.as_ref()) {
                (Some(buffer), Some(store)) => buffer.is_complete(store),
                _ => false,
            };
            let target = if buffered {
                TorrentState::Playing
            } else {
                TorrentState::Buffering
            };
            let next = state.transition(target)?;
            if let Some(buffer) = inner.buffer.as_mut() {
                buffer.set_paused(false);
            }
            self.set_state(next);
        }
        self.reconcile();
        self.advance_playback();
        Ok(())
    }

    /// Moves the torrent to the error state. Blocked readers wake up and
    /// fail with `kind`.
    pub fn fail(&self, kind: ErrorKind, detail: impl Into<String>) -> bool {
        let detail = detail.into();
        let mut inner = self.inner.lock();
        if !self.state().can_transition(TorrentState::Error) {
            return false;
        }
        tracing::error!(info_hash = %self.info_hash, kind = %kind, "Torrent failed: {detail}");
        inner.failure = Some((kind, detail));
        self.set_state(TorrentState::Error);
        true
    }

    /// Marks the torrent for removal and stops priority updates.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Transition` - Torrent is already reaping or gone
    pub fn begin_reaping(&self) -> Result<(), TorrentError> {
        let _inner = self.inner.lock();
        let next = self.state().transition(TorrentState::Reaping)?;
        self.set_state(next);
        self.cancel.cancel();
        Ok(())
    }

    /// Tears the store down, waking blocked readers, and marks the torrent
    /// gone.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Store` - Payload files could not be removed
    pub async fn finish_reaping(&self, delete_files: bool) -> Result<(), TorrentError> {
        let store = self.inner.lock().store.clone();
        let result = match store {
            Some(store) => store.close(delete_files).await,
            None => Ok(()),
        };
        let _inner = self.inner.lock();
        if self.state().can_transition(TorrentState::Gone) {
            self.set_state(TorrentState::Gone);
        }
        result.map_err(TorrentError::from)
    }

    /// Applies new buffer tuning; the tail keeps its length.
    pub fn reconfigure(&self, settings: TorrentSettings) {
        {
            let mut inner = self.inner.lock();
            let capacity = inner.store.as_ref().and_then(|store| store.capacity());
            if let Some(buffer) = inner.buffer.as_mut() {
                buffer.reconfigure(&settings.buffer, capacity);
            }
            inner.settings = settings;
        }
        self.reconcile();
    }

    pub fn snapshot(&self, stats: SwarmStats) -> TorrentSnapshot {
        let inner = self.inner.lock();
        let selected_file = inner.metainfo.as_ref().and_then(|metainfo| {
            let file = metainfo.files.get(inner.selected?)?;
            Some(SelectedFile {
                index: file.index,
                path: file.display_path(),
                length: file.length,
            })
        });
        let progress = match (inner.buffer.as_ref(), inner.store.as_ref()) {
            (Some(buffer), Some(store)) => {
                let pieces = buffer.playback_pieces();
                let total: u64 = pieces.iter().map(|piece| u64::from(store.piece_size(piece))).sum();
                if total == 0 {
                    100.0
                } else {
                    store.downloaded_bytes(pieces) as f64 * 100.0 / total as f64
                }
            }
            _ => 0.0,
        };
        TorrentSnapshot {
            id: self.info_hash,
            name: inner.name.clone(),
            state: self.state(),
            progress,
            size: inner.metainfo.as_ref().map_or(0, |metainfo| metainfo.total_length),
            download_rate: stats.download_rate,
            upload_rate: stats.upload_rate,
            peers: stats.peers,
            readers: inner.buffer.as_ref().map_or(0, BufferController::reader_count),
            stalled: inner.buffer.as_ref().is_some_and(BufferController::is_stalled),
            selected_file,
            error: inner.failure.as_ref().map(|(kind, _)| *kind),
            added_at: self.added_at,
            context: inner.context.clone(),
        }
    }

    fn set_state(&self, next: TorrentState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(info_hash = %self.info_hash, from = %previous, to = %next, "Torrent state changed");
        }
    }
}

impl Drop for Torrent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Applies the newest priority batch whenever one is queued.
async fn push_priorities(
    engine: Arc<dyn SwarmEngine>,
    info_hash: InfoHash,
    mut batches: watch::Receiver<Option<PriorityMap>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = batches.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let Some(map) = batches.borrow_and_update().clone() else {
            continue;
        };
        if let Err(e) = engine.apply_priorities(info_hash, map).await {
            tracing::debug!(info_hash = %info_hash, "Priority batch not applied: {e}");
        }
    }
}
