//! Piece storage for active torrents.
//!
//! A [`PieceStore`] accepts block writes from the swarm engine, verifies
//! completed pieces against the metainfo hashes and serves verified bytes to
//! readers. Two backings exist: a fixed ring of memory slots and sparse
//! on-disk files with windowed retention.
//!
//! Disk I/O never runs under the piece-state lock: payload files sit behind
//! their own mutex and the synchronous methods touch them only after the
//! state lock is released. Async callers use [`PieceStore::put_block`],
//! [`PieceStore::verify_piece`] and [`PieceStore::fetch_block`], which move
//! file-store work onto the blocking pool.

pub mod coverage;
pub(crate) mod file;
pub(crate) mod memory;

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::sync::watch;

use self::coverage::Coverage;
use self::file::SparseFiles;
use self::memory::{MemorySlots, SlotStatus};
use crate::config::StoragePolicyKind;
use crate::error::ErrorKind;
use crate::torrent::metainfo::piece_size;
use crate::torrent::{InfoHash, Metainfo, PieceRange};

/// Minimum spacing of resume writes triggered by verification or eviction.
const RESUME_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of one piece inside a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceState {
    Absent,
    Partial,
    /// All blocks received, hash check pending
    Present,
    Verified,
    Evicted,
}

/// Result of accepting a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWrite {
    Accepted,
    /// The block completed the piece; call [`PieceStore::on_piece_complete`]
    PieceFull,
    /// Piece already complete; block ignored
    Duplicate,
}

/// How a store backs its piece data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoragePolicy {
    Memory {
        budget: u64,
    },
    File {
        /// Directory holding this torrent's payload tree
        root: PathBuf,
        /// Sidecar bitfield for fast resume
        resume: PathBuf,
    },
}

impl StoragePolicy {
    pub fn kind(&self) -> StoragePolicyKind {
        match self {
            StoragePolicy::Memory { .. } => StoragePolicyKind::Memory,
            StoragePolicy::File { .. } => StoragePolicyKind::File,
        }
    }
}

/// Errors that can occur during piece storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Piece {piece} out of range (torrent has {count} pieces)")]
    PieceOutOfRange { piece: u32, count: u32 },

    #[error("Invalid block for piece {piece}: offset {offset}, length {length}")]
    InvalidBlock { piece: u32, offset: u32, length: u32 },

    #[error("Piece {piece} not present")]
    NotPresent { piece: u32 },

    #[error("Piece {piece} is not fully written")]
    Incomplete { piece: u32 },

    #[error("No slot can be freed for piece {piece}")]
    EvictionRefused { piece: u32 },

    #[error("Piece store torn down")]
    TornDown,

    #[error("Storage write failed: {message}")]
    StorageFull { message: String },

    #[error("Storage I/O error")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::EvictionRefused { .. } => ErrorKind::EvictionRefused,
            StoreError::TornDown => ErrorKind::Shutdown,
            StoreError::StorageFull { .. } => ErrorKind::StorageFull,
            StoreError::NotPresent { .. } => ErrorKind::MetadataPending,
            _ => ErrorKind::Internal,
        }
    }

    fn from_write(error: std::io::Error) -> Self {
        StoreError::StorageFull {
            message: error.to_string(),
        }
    }
}

#[derive(Debug)]
enum Backing {
    Memory(MemorySlots),
    /// Payload lives in `PieceStore::disk`
    Disk,
    Closed,
}

#[derive(Debug)]
struct StoreInner {
    pieces: Vec<PieceState>,
    /// Pieces verified at least once, resident or not
    downloaded: Vec<bool>,
    coverage: HashMap<u32, Coverage>,
    pins: HashMap<u32, usize>,
    /// Windows the buffer controller wants retained
    protected: Vec<PieceRange>,
    backing: Backing,
}

impl StoreInner {
    fn is_protected(&self, piece: u32) -> bool {
        self.protected.iter().any(|range| range.contains(piece))
    }

    /// State of `piece` when it may be evicted right now.
    fn evictable(&self, piece: u32) -> Option<PieceState> {
        if self.pins.contains_key(&piece) {
            return None;
        }
        let state = self.pieces[piece as usize];
        (!matches!(state, PieceState::Absent | PieceState::Evicted)).then_some(state)
    }

    fn mark_evicted(&mut self, piece: u32, state: PieceState) {
        self.coverage.remove(&piece);
        self.pieces[piece as usize] = match state {
            PieceState::Verified => PieceState::Evicted,
            _ => PieceState::Absent,
        };
    }

    fn present_bitfield(&self) -> Vec<bool> {
        self.pieces
            .iter()
            .map(|state| *state == PieceState::Verified)
            .collect()
    }
}

/// Sidecar bitfield of verified pieces, written lazily.
#[derive(Debug)]
struct ResumeFile {
    path: PathBuf,
    dirty: AtomicBool,
    /// Last successful write; also serializes writers
    written: Mutex<Option<Instant>>,
}

/// Backing store for one torrent's pieces.
#[derive(Debug)]
pub struct PieceStore {
    info_hash: InfoHash,
    piece_length: u32,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
    policy: StoragePolicyKind,
    resume: Option<ResumeFile>,
    inner: Mutex<StoreInner>,
    /// Payload files of a file store; `None` for memory stores and once closed.
    /// Never acquired while `inner` is held.
    disk: Mutex<Option<SparseFiles>>,
    completions: watch::Sender<u64>,
    torn_down: AtomicBool,
}

impl PieceStore {
    /// Prepares storage for `metainfo`.
    ///
    /// Memory stores allocate `max(1, budget / piece_length)` slots lazily.
    /// File stores create one sparse file per entry and re-hash any pieces
    /// the resume bitfield claims before trusting them. File stores do
    /// blocking I/O; call from a blocking context.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - Payload files could not be created or read
    pub fn open(metainfo: &Metainfo, policy: StoragePolicy) -> Result<Arc<Self>, StoreError> {
        let count = metainfo.piece_count() as usize;
        let (backing, disk, resume) = match &policy {
            StoragePolicy::Memory { budget } => {
                let capacity = (budget / u64::from(metainfo.piece_length)).max(1) as usize;
                (
                    Backing::Memory(MemorySlots::new(capacity, metainfo.piece_length)),
                    None,
                    None,
                )
            }
            StoragePolicy::File { root, resume } => (
                Backing::Disk,
                Some(SparseFiles::open(root, &metainfo.files)?),
                Some(ResumeFile {
                    path: resume.clone(),
                    dirty: AtomicBool::new(false),
                    written: Mutex::new(None),
                }),
            ),
        };

        let store = Self {
            info_hash: metainfo.info_hash,
            piece_length: metainfo.piece_length,
            total_length: metainfo.total_length,
            hashes: metainfo.piece_hashes.clone(),
            policy: policy.kind(),
            resume,
            inner: Mutex::new(StoreInner {
                pieces: vec![PieceState::Absent; count],
                downloaded: vec![false; count],
                coverage: HashMap::new(),
                pins: HashMap::new(),
                protected: Vec::new(),
                backing,
            }),
            disk: Mutex::new(disk),
            completions: watch::channel(0).0,
            torn_down: AtomicBool::new(false),
        };

        if let Some(resume) = &store.resume {
            let claimed = file::load_resume(&resume.path, metainfo.piece_count());
            let restored = store.restore(&claimed);
            tracing::info!(
                info_hash = %store.info_hash,
                claimed = claimed.len(),
                restored,
                "Restored pieces from resume data"
            );
        }

        Ok(Arc::new(store))
    }

    fn restore(&self, claimed: &[u32]) -> usize {
        let intact: Vec<u32> = claimed
            .iter()
            .copied()
            .filter(|piece| {
                self.read_from_disk(self.piece_offset(*piece), self.piece_size(*piece) as usize)
                    .is_ok_and(|data| Sha1::digest(&data).as_slice() == self.hashes[*piece as usize])
            })
            .collect();
        let mut inner = self.inner.lock();
        for &piece in &intact {
            inner.pieces[piece as usize] = PieceState::Verified;
            inner.downloaded[piece as usize] = true;
        }
        intact.len()
    }

    fn read_from_disk(&self, offset: u64, length: usize) -> Result<Vec<u8>, StoreError> {
        let mut disk = self.disk.lock();
        let files = disk.as_mut().ok_or(StoreError::TornDown)?;
        Ok(files.read_at(offset, length)?)
    }

    fn write_to_disk(&self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let mut disk = self.disk.lock();
        let files = disk.as_mut().ok_or(StoreError::TornDown)?;
        files.write_at(offset, data).map_err(StoreError::from_write)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn policy(&self) -> StoragePolicyKind {
        self.policy
    }

    pub fn piece_count(&self) -> u32 {
        self.hashes.len() as u32
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Length of `piece`; zero when out of range.
    pub fn piece_size(&self, piece: u32) -> u32 {
        if piece >= self.piece_count() {
            return 0;
        }
        piece_size(self.piece_length, self.total_length, piece)
    }

    fn piece_offset(&self, piece: u32) -> u64 {
        u64::from(piece) * u64::from(self.piece_length)
    }

    fn check_range(&self, piece: u32) -> Result<(), StoreError> {
        if piece >= self.piece_count() {
            return Err(StoreError::PieceOutOfRange {
                piece,
                count: self.piece_count(),
            });
        }
        Ok(())
    }

    /// Slot count for memory stores.
    pub fn capacity(&self) -> Option<usize> {
        match &self.inner.lock().backing {
            Backing::Memory(slots) => Some(slots.capacity()),
            _ => None,
        }
    }

    pub fn state(&self, piece: u32) -> PieceState {
        self.inner
            .lock()
            .pieces
            .get(piece as usize)
            .copied()
            .unwrap_or(PieceState::Absent)
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.state(piece) == PieceState::Verified
    }

    /// Whether every piece of `range` is verified and resident.
    pub fn all_verified(&self, range: PieceRange) -> bool {
        let inner = self.inner.lock();
        range
            .iter()
            .all(|piece| inner.pieces.get(piece as usize) == Some(&PieceState::Verified))
    }

    /// Whether every piece of `range` has been verified at least once.
    pub fn all_downloaded(&self, range: PieceRange) -> bool {
        let inner = self.inner.lock();
        range
            .iter()
            .all(|piece| inner.downloaded.get(piece as usize) == Some(&true))
    }

    /// Pieces currently verified and resident.
    pub fn verified_count(&self) -> usize {
        self.inner
            .lock()
            .pieces
            .iter()
            .filter(|state| **state == PieceState::Verified)
            .count()
    }

    /// Pieces verified at least once.
    pub fn downloaded_count(&self) -> usize {
        self.inner.lock().downloaded.iter().filter(|d| **d).count()
    }

    /// Bytes verified at least once within `range`.
    pub fn downloaded_bytes(&self, range: PieceRange) -> u64 {
        let inner = self.inner.lock();
        range
            .iter()
            .filter(|piece| inner.downloaded.get(*piece as usize) == Some(&true))
            .map(|piece| u64::from(self.piece_size(piece)))
            .sum()
    }

    /// Verified-and-resident bitfield, for advertising to peers.
    pub fn have_bitfield(&self) -> Vec<bool> {
        self.inner.lock().present_bitfield()
    }

    /// Block-sized gaps of `piece` still to be fetched.
    pub fn missing_blocks(&self, piece: u32, block: u32) -> Vec<Range<u32>> {
        let size = self.piece_size(piece);
        let inner = self.inner.lock();
        match inner.pieces.get(piece as usize) {
            Some(PieceState::Verified | PieceState::Present) | None => Vec::new(),
            Some(_) => match inner.coverage.get(&piece) {
                Some(coverage) => coverage.missing(size, block),
                None => Coverage::new().missing(size, block),
            },
        }
    }

    /// Replaces the set of windows whose pieces must be retained.
    pub fn set_protected(&self, ranges: Vec<PieceRange>) {
        self.inner.lock().protected = ranges;
    }

    /// Accepts a block from the engine.
    ///
    /// # Errors
    ///
    /// - `StoreError::PieceOutOfRange` / `StoreError::InvalidBlock` - Block outside the piece
    /// - `StoreError::EvictionRefused` - Memory store has no slot it may reuse
    /// - `StoreError::StorageFull` - Disk write failed
    /// - `StoreError::TornDown` - Store is closed
    pub fn write_block(&self, piece: u32, offset: u32, data: &[u8]) -> Result<BlockWrite, StoreError> {
        self.check_range(piece)?;
        let size = self.piece_size(piece);
        let length = data.len() as u32;
        if data.is_empty() || u64::from(offset) + u64::from(length) > u64::from(size) {
            return Err(StoreError::InvalidBlock {
                piece,
                offset,
                length,
            });
        }
        if self.is_torn_down() {
            return Err(StoreError::TornDown);
        }

        let is_settled = |inner: &StoreInner| {
            matches!(
                inner.pieces[piece as usize],
                PieceState::Verified | PieceState::Present
            )
        };
        let mut guard = self.inner.lock();
        if is_settled(&*guard) {
            return Ok(BlockWrite::Duplicate);
        }

        if matches!(guard.backing, Backing::Disk) {
            drop(guard);
            self.write_to_disk(self.piece_offset(piece) + u64::from(offset), data)?;
            guard = self.inner.lock();
            if is_settled(&*guard) {
                return Ok(BlockWrite::Duplicate);
            }
        } else {
            let inner = &mut *guard;
            let incoming_protected = inner.is_protected(piece);
            let Backing::Memory(slots) = &mut inner.backing else {
                return Err(StoreError::TornDown);
            };
            let pins = &inner.pins;
            let protected = &inner.protected;
            let allocation = slots
                .allocate(piece, incoming_protected, |candidate| {
                    !pins.contains_key(&candidate) && !protected.iter().any(|range| range.contains(candidate))
                })
                .ok_or(StoreError::EvictionRefused { piece })?;
            if let Some((old, status)) = allocation.displaced {
                inner.pieces[old as usize] = match status {
                    SlotStatus::Filled => PieceState::Evicted,
                    _ => PieceState::Absent,
                };
                inner.coverage.remove(&old);
                tracing::trace!(info_hash = %self.info_hash, piece = old, "Evicted for {piece}");
            }
            slots.write(allocation.slot, offset as usize, data);
        }

        let inner = &mut *guard;
        let coverage = inner.coverage.entry(piece).or_default();
        coverage.insert(offset..offset + length);
        if coverage.is_complete(size) {
            inner.pieces[piece as usize] = PieceState::Present;
            Ok(BlockWrite::PieceFull)
        } else {
            inner.pieces[piece as usize] = PieceState::Partial;
            Ok(BlockWrite::Accepted)
        }
    }

    /// Verifies a fully written piece against its metainfo hash.
    ///
    /// Returns `true` when the piece is now verified. On mismatch the piece
    /// returns to absent and its memory slot is freed.
    ///
    /// # Errors
    ///
    /// - `StoreError::Incomplete` - Not every block has been written
    /// - `StoreError::Io` - Payload could not be read back
    pub fn on_piece_complete(&self, piece: u32) -> Result<bool, StoreError> {
        self.check_range(piece)?;
        let size = self.piece_size(piece) as usize;
        let offset = self.piece_offset(piece);
        let expected = self.hashes[piece as usize];

        let mut guard = self.inner.lock();
        match guard.pieces[piece as usize] {
            PieceState::Verified => return Ok(true),
            PieceState::Present => {}
            _ => return Err(StoreError::Incomplete { piece }),
        }

        let matches = if matches!(guard.backing, Backing::Disk) {
            drop(guard);
            let data = self.read_from_disk(offset, size)?;
            let matches = Sha1::digest(&data).as_slice() == expected;
            guard = self.inner.lock();
            // Evicted or verified by someone else while hashing.
            match guard.pieces[piece as usize] {
                PieceState::Present => matches,
                state => return Ok(state == PieceState::Verified),
            }
        } else {
            let Backing::Memory(slots) = &mut guard.backing else {
                return Err(StoreError::TornDown);
            };
            let slot = slots.slot_of(piece).ok_or(StoreError::Incomplete { piece })?;
            let matches = Sha1::digest(slots.bytes(slot, 0, size)).as_slice() == expected;
            if matches {
                slots.mark_filled(slot);
            } else {
                slots.release(piece);
            }
            matches
        };

        let inner = &mut *guard;
        inner.coverage.remove(&piece);
        if matches {
            inner.pieces[piece as usize] = PieceState::Verified;
            inner.downloaded[piece as usize] = true;
        } else {
            inner.pieces[piece as usize] = PieceState::Absent;
            tracing::warn!(info_hash = %self.info_hash, piece, "Piece failed hash check");
        }
        drop(guard);

        if matches {
            self.completions.send_modify(|generation| *generation += 1);
            self.resume_changed();
        }
        Ok(matches)
    }

    /// Marks the resume bitfield stale and writes it unless a write happened
    /// within the last second. Leftover changes go out with the next
    /// [`PieceStore::flush_resume`].
    fn resume_changed(&self) {
        let Some(resume) = &self.resume else {
            return;
        };
        resume.dirty.store(true, Ordering::Release);
        let due = resume
            .written
            .lock()
            .is_none_or(|at| at.elapsed() >= RESUME_FLUSH_INTERVAL);
        if due {
            if let Err(e) = self.flush_resume() {
                tracing::warn!(info_hash = %self.info_hash, "Failed to write resume data: {e}");
            }
        }
    }

    /// Writes the resume bitfield if it changed since the last write.
    /// Returns whether a write happened. Does blocking file I/O.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - The sidecar file could not be written
    pub fn flush_resume(&self) -> Result<bool, StoreError> {
        if self.is_torn_down() {
            return Ok(false);
        }
        self.write_resume()
    }

    fn write_resume(&self) -> Result<bool, StoreError> {
        let Some(resume) = &self.resume else {
            return Ok(false);
        };
        let mut written = resume.written.lock();
        if !resume.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let bitfield = self.inner.lock().present_bitfield();
        if let Err(e) = file::save_resume(&resume.path, &bitfield) {
            resume.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        *written = Some(Instant::now());
        Ok(true)
    }

    /// Whether verified pieces changed since the resume file was last written.
    pub fn resume_pending(&self) -> bool {
        self.resume
            .as_ref()
            .is_some_and(|resume| resume.dirty.load(Ordering::Acquire))
    }

    /// Copies bytes out of a verified piece. Never blocks on availability.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotPresent` - Piece is not verified and resident
    /// - `StoreError::InvalidBlock` - Range exceeds the piece
    pub fn read_block(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StoreError> {
        self.check_range(piece)?;
        let size = self.piece_size(piece);
        if u64::from(offset) + u64::from(length) > u64::from(size) {
            return Err(StoreError::InvalidBlock {
                piece,
                offset,
                length,
            });
        }

        {
            let inner = self.inner.lock();
            if inner.pieces[piece as usize] != PieceState::Verified {
                return Err(StoreError::NotPresent { piece });
            }
            match &inner.backing {
                Backing::Memory(slots) => {
                    let slot = slots.slot_of(piece).ok_or(StoreError::NotPresent { piece })?;
                    return Ok(Bytes::copy_from_slice(slots.bytes(
                        slot,
                        offset as usize,
                        length as usize,
                    )));
                }
                Backing::Disk => {}
                Backing::Closed => return Err(StoreError::TornDown),
            }
        }

        let data = self.read_from_disk(self.piece_offset(piece) + u64::from(offset), length as usize)?;
        // An unpinned piece may have been punched while it was read.
        if !self.is_verified(piece) {
            return Err(StoreError::NotPresent { piece });
        }
        Ok(Bytes::from(data))
    }

    /// Drops a piece's data unless a reader holds a pin on it.
    ///
    /// Partial pieces lose their received blocks. Returns whether anything
    /// was released.
    ///
    /// # Errors
    ///
    /// - `StoreError::PieceOutOfRange` - Piece index outside the torrent
    pub fn evict(&self, piece: u32) -> Result<bool, StoreError> {
        self.check_range(piece)?;
        if self.policy == StoragePolicyKind::File {
            return Ok(self.evict_from_disk(piece));
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(state) = inner.evictable(piece) else {
            return Ok(false);
        };
        let Backing::Memory(slots) = &mut inner.backing else {
            return Ok(false);
        };
        if !slots.release(piece) {
            return Ok(false);
        }
        inner.mark_evicted(piece, state);
        Ok(true)
    }

    fn evict_from_disk(&self, piece: u32) -> bool {
        // Held until the hole is punched so no block write for the piece
        // lands in between.
        let mut disk = self.disk.lock();
        let state = {
            let mut inner = self.inner.lock();
            if matches!(inner.backing, Backing::Closed) {
                return false;
            }
            let Some(state) = inner.evictable(piece) else {
                return false;
            };
            inner.mark_evicted(piece, state);
            state
        };
        if state != PieceState::Verified {
            return true;
        }

        let offset = self.piece_offset(piece);
        let size = u64::from(self.piece_size(piece));
        let punched = disk.as_mut().is_some_and(|files| files.punch(offset, size));
        drop(disk);
        if !punched {
            let mut inner = self.inner.lock();
            if inner.pieces[piece as usize] == PieceState::Evicted {
                inner.pieces[piece as usize] = PieceState::Verified;
            }
            return false;
        }
        self.resume_changed();
        true
    }

    /// Deallocates verified pieces outside `keep` once the torrent exceeds
    /// `watermark` bytes. Only file stores are swept, and pieces inside the
    /// current protected windows always stay. Returns pieces released.
    /// Does blocking file I/O.
    pub fn sweep(&self, keep: &[PieceRange], watermark: u64) -> usize {
        if self.policy != StoragePolicyKind::File || self.total_length <= watermark {
            return 0;
        }
        let candidates: Vec<u32> = {
            let inner = self.inner.lock();
            (0..self.piece_count())
                .filter(|piece| inner.pieces[*piece as usize] == PieceState::Verified)
                .filter(|piece| !keep.iter().any(|range| range.contains(*piece)))
                .filter(|piece| !inner.is_protected(*piece) && !inner.pins.contains_key(piece))
                .collect()
        };
        let released = candidates
            .into_iter()
            .filter(|piece| matches!(self.evict(*piece), Ok(true)))
            .count();
        if released > 0 {
            tracing::debug!(info_hash = %self.info_hash, released, "Swept pieces outside windows");
        }
        released
    }

    /// [`PieceStore::write_block`] for async callers.
    ///
    /// # Errors
    ///
    /// Same as [`PieceStore::write_block`].
    pub async fn put_block(self: &Arc<Self>, piece: u32, offset: u32, data: Bytes) -> Result<BlockWrite, StoreError> {
        if self.policy == StoragePolicyKind::Memory {
            return self.write_block(piece, offset, &data);
        }
        let store = Arc::clone(self);
        off_worker(move || store.write_block(piece, offset, &data)).await
    }

    /// [`PieceStore::on_piece_complete`] for async callers.
    ///
    /// # Errors
    ///
    /// Same as [`PieceStore::on_piece_complete`].
    pub async fn verify_piece(self: &Arc<Self>, piece: u32) -> Result<bool, StoreError> {
        if self.policy == StoragePolicyKind::Memory {
            return self.on_piece_complete(piece);
        }
        let store = Arc::clone(self);
        off_worker(move || store.on_piece_complete(piece)).await
    }

    /// [`PieceStore::read_block`] for async callers.
    ///
    /// # Errors
    ///
    /// Same as [`PieceStore::read_block`].
    pub async fn fetch_block(self: &Arc<Self>, piece: u32, offset: u32, length: u32) -> Result<Bytes, StoreError> {
        if self.policy == StoragePolicyKind::Memory {
            return self.read_block(piece, offset, length);
        }
        let store = Arc::clone(self);
        off_worker(move || store.read_block(piece, offset, length)).await
    }

    /// [`PieceStore::teardown`] for async callers.
    ///
    /// # Errors
    ///
    /// Same as [`PieceStore::teardown`].
    pub async fn close(self: &Arc<Self>, delete_files: bool) -> Result<(), StoreError> {
        if self.policy == StoragePolicyKind::Memory {
            return self.teardown(delete_files);
        }
        let store = Arc::clone(self);
        off_worker(move || store.teardown(delete_files)).await
    }

    /// Pins `piece` against eviction until the guard is dropped.
    pub fn pin(self: &Arc<Self>, piece: u32) -> PinGuard {
        *self.inner.lock().pins.entry(piece).or_insert(0) += 1;
        PinGuard {
            store: Arc::clone(self),
            piece,
        }
    }

    fn unpin(&self, piece: u32) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.pins.get_mut(&piece) {
            *count -= 1;
            if *count == 0 {
                inner.pins.remove(&piece);
            }
        }
    }

    pub fn pin_count(&self, piece: u32) -> usize {
        self.inner.lock().pins.get(&piece).copied().unwrap_or(0)
    }

    /// Resolves once `piece` is verified, or fails when the store tears down.
    ///
    /// # Errors
    ///
    /// - `StoreError::TornDown` - Store closed while waiting
    /// - `StoreError::PieceOutOfRange` - Piece index outside the torrent
    pub async fn await_piece(&self, piece: u32) -> Result<(), StoreError> {
        self.check_range(piece)?;
        let mut completions = self.completions.subscribe();
        loop {
            if self.is_torn_down() {
                return Err(StoreError::TornDown);
            }
            if self.is_verified(piece) {
                return Ok(());
            }
            if completions.changed().await.is_err() {
                return Err(StoreError::TornDown);
            }
        }
    }

    /// Receiver bumped on every verification and on teardown.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.completions.subscribe()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Closes the store and wakes every waiter. With `delete_files`, the
    /// payload tree and resume data are removed.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - Payload files could not be removed
    pub fn teardown(&self, delete_files: bool) -> Result<(), StoreError> {
        self.torn_down.store(true, Ordering::Release);
        self.completions.send_modify(|generation| *generation += 1);

        let backing = std::mem::replace(&mut self.inner.lock().backing, Backing::Closed);
        if let Backing::Memory(mut slots) = backing {
            slots.clear();
        }
        let files = self.disk.lock().take();
        if let Some(mut files) = files {
            files.flush()?;
            files.close(delete_files)?;
        }
        if let Some(resume) = &self.resume {
            if delete_files {
                match std::fs::remove_file(&resume.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                self.write_resume()?;
            }
        }
        tracing::debug!(info_hash = %self.info_hash, delete_files, "Piece store torn down");
        Ok(())
    }
}

/// Runs blocking store work on the blocking pool.
async fn off_worker<T, F>(work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

/// Refcounted pin on one piece; released on drop.
#[derive(Debug)]
pub struct PinGuard {
    store: Arc<PieceStore>,
    piece: u32,
}

impl PinGuard {
    pub fn piece(&self) -> u32 {
        self.piece
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.store.unpin(self.piece);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::torrent::metainfo::fixtures::{metainfo, payload_byte};

    const PIECE: u32 = 16384;
    const SEED: u8 = 7;

    fn piece_bytes(meta: &Metainfo, piece: u32) -> Vec<u8> {
        let start = u64::from(piece) * u64::from(meta.piece_length);
        let size = u64::from(meta.piece_size(piece));
        (start..start + size).map(|p| payload_byte(SEED, p)).collect()
    }

    fn fill(store: &PieceStore, meta: &Metainfo, piece: u32) -> bool {
        let data = piece_bytes(meta, piece);
        assert_eq!(store.write_block(piece, 0, &data).unwrap(), BlockWrite::PieceFull);
        store.on_piece_complete(piece).unwrap()
    }

    fn memory_store(pieces: u64, slots: u64) -> (Metainfo, Arc<PieceStore>) {
        let meta = metainfo("m.mkv", PIECE, &[("m.mkv", pieces * u64::from(PIECE) - 100)], SEED);
        let store = PieceStore::open(
            &meta,
            StoragePolicy::Memory {
                budget: slots * u64::from(PIECE),
            },
        )
        .unwrap();
        (meta, store)
    }

    #[test]
    fn test_blockwise_write_equals_one_shot() {
        let (meta, store) = memory_store(4, 4);
        let data = piece_bytes(&meta, 1);
        let mut offsets: Vec<u32> = (0..PIECE).step_by(4096).collect();
        offsets.reverse();
        for offset in offsets {
            let end = (offset + 4096) as usize;
            let result = store.write_block(1, offset, &data[offset as usize..end]).unwrap();
            let expected = if offset == 0 { BlockWrite::PieceFull } else { BlockWrite::Accepted };
            assert_eq!(result, expected);
        }
        assert!(store.on_piece_complete(1).unwrap());
        assert!(fill(&store, &meta, 2));

        assert_eq!(store.read_block(1, 0, PIECE).unwrap().as_ref(), &data[..]);
        assert_eq!(
            store.read_block(2, 0, PIECE).unwrap().as_ref(),
            &piece_bytes(&meta, 2)[..]
        );
    }

    #[test]
    fn test_hash_mismatch_returns_piece_to_absent() {
        let (_, store) = memory_store(4, 4);
        store.write_block(0, 0, &vec![0xAA; PIECE as usize]).unwrap();
        assert_eq!(store.state(0), PieceState::Present);
        assert!(!store.on_piece_complete(0).unwrap());
        assert_eq!(store.state(0), PieceState::Absent);
        assert!(matches!(
            store.read_block(0, 0, 10),
            Err(StoreError::NotPresent { piece: 0 })
        ));
    }

    #[test]
    fn test_short_last_piece() {
        let (meta, store) = memory_store(3, 3);
        assert_eq!(store.piece_size(2), PIECE - 100);
        assert!(fill(&store, &meta, 2));
        assert!(matches!(
            store.write_block(2, PIECE - 100, &[1]),
            Err(StoreError::InvalidBlock { .. })
        ));
        let tail = store.read_block(2, PIECE - 110, 10).unwrap();
        assert_eq!(tail.as_ref(), &piece_bytes(&meta, 2)[(PIECE - 110) as usize..]);
    }

    #[test]
    fn test_eviction_respects_pins_and_windows() {
        let (meta, store) = memory_store(100, 4);
        for piece in 0..4 {
            assert!(fill(&store, &meta, piece));
        }
        let _reading = store.pin(0);
        store.set_protected(vec![PieceRange::new(0, 4)]);

        let data = piece_bytes(&meta, 4);
        assert!(matches!(
            store.write_block(4, 0, &data),
            Err(StoreError::EvictionRefused { piece: 4 })
        ));

        // Window moves on; piece 0 stays pinned, so the oldest other piece goes.
        store.set_protected(vec![PieceRange::new(4, 8)]);
        assert_eq!(store.write_block(4, 0, &data).unwrap(), BlockWrite::PieceFull);
        assert!(store.on_piece_complete(4).unwrap());
        assert_eq!(store.state(0), PieceState::Verified);
        assert_eq!(store.state(1), PieceState::Evicted);
    }

    #[test]
    fn test_resident_pieces_never_exceed_capacity() {
        let (meta, store) = memory_store(20, 3);
        assert_eq!(store.capacity(), Some(3));
        for piece in 0..20 {
            store.set_protected(vec![PieceRange::new(piece, piece + 1)]);
            assert!(fill(&store, &meta, piece));
            assert!(store.verified_count() <= 3);
        }
        assert_eq!(store.downloaded_count(), 20);
    }

    #[test]
    fn test_single_slot_serves_sequential_reads() {
        let (meta, store) = memory_store(5, 1);
        for piece in 0..5 {
            store.set_protected(vec![PieceRange::new(piece, piece + 1)]);
            assert!(fill(&store, &meta, piece));
            let pin = store.pin(piece);
            let bytes = store.read_block(piece, 0, store.piece_size(piece)).unwrap();
            assert_eq!(bytes.as_ref(), &piece_bytes(&meta, piece)[..]);
            drop(pin);
        }
    }

    #[test]
    fn test_evict_refuses_pinned_piece() {
        let (meta, store) = memory_store(4, 4);
        assert!(fill(&store, &meta, 0));
        let pin = store.pin(0);
        let second = store.pin(0);
        assert_eq!(store.pin_count(0), 2);
        assert!(!store.evict(0).unwrap());
        drop(pin);
        assert!(!store.evict(0).unwrap());
        drop(second);
        assert!(store.evict(0).unwrap());
        assert_eq!(store.state(0), PieceState::Evicted);
    }

    #[test]
    fn test_await_piece_wakes_on_completion() {
        let (meta, store) = memory_store(4, 4);
        let mut waiter = tokio_test::task::spawn(store.await_piece(3));
        tokio_test::assert_pending!(waiter.poll());

        assert!(fill(&store, &meta, 2));
        assert!(waiter.is_woken());
        tokio_test::assert_pending!(waiter.poll());

        assert!(fill(&store, &meta, 3));
        assert!(waiter.is_woken());
        tokio_test::assert_ready_ok!(waiter.poll());
    }

    #[tokio::test]
    async fn test_teardown_wakes_waiters() {
        let (_, store) = memory_store(4, 4);
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.await_piece(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.teardown(false).unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(StoreError::TornDown)));
        assert!(matches!(store.write_block(0, 0, &[1]), Err(StoreError::TornDown)));
    }

    #[test]
    fn test_file_store_resumes_verified_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metainfo(
            "pack",
            PIECE,
            &[("a.mkv", 20000), ("b.srt", 30000)],
            SEED,
        );
        let policy = StoragePolicy::File {
            root: dir.path().join("payload"),
            resume: dir.path().join("x.resume"),
        };

        let store = PieceStore::open(&meta, policy.clone()).unwrap();
        assert!(fill(&store, &meta, 0));
        assert!(fill(&store, &meta, 1));
        store.teardown(false).unwrap();

        let reopened = PieceStore::open(&meta, policy).unwrap();
        assert!(reopened.is_verified(0));
        assert!(reopened.is_verified(1));
        assert!(!reopened.is_verified(2));
        let bytes = reopened.read_block(1, 0, PIECE).unwrap();
        assert_eq!(bytes.as_ref(), &piece_bytes(&meta, 1)[..]);
    }

    #[test]
    fn test_file_store_sweep_honours_watermark_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metainfo("big.mkv", PIECE, &[("big.mkv", 6 * u64::from(PIECE))], SEED);
        let store = PieceStore::open(
            &meta,
            StoragePolicy::File {
                root: dir.path().join("payload"),
                resume: dir.path().join("big.resume"),
            },
        )
        .unwrap();
        for piece in 0..6 {
            assert!(fill(&store, &meta, piece));
        }

        assert_eq!(store.sweep(&[PieceRange::new(2, 4)], u64::MAX), 0);

        let _pin = store.pin(0);
        let released = store.sweep(&[PieceRange::new(2, 4)], 0);
        // Hole punching depends on the filesystem; whatever was released must
        // come from outside the windows.
        let evicted = [1, 4, 5]
            .into_iter()
            .filter(|piece| store.state(*piece) == PieceState::Evicted)
            .count();
        assert_eq!(evicted, released);
        assert!(store.is_verified(0));
        assert!(store.is_verified(2));
        assert!(store.is_verified(3));
    }

    #[test]
    fn test_resume_writes_are_spaced_and_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metainfo("r.mkv", PIECE, &[("r.mkv", 4 * u64::from(PIECE))], SEED);
        let resume = dir.path().join("r.resume");
        let store = PieceStore::open(
            &meta,
            StoragePolicy::File {
                root: dir.path().join("payload"),
                resume: resume.clone(),
            },
        )
        .unwrap();

        assert!(fill(&store, &meta, 0));
        assert!(!store.resume_pending());
        assert_eq!(file::load_resume(&resume, 4), vec![0]);

        // Within the flush interval the change is only recorded.
        assert!(fill(&store, &meta, 1));
        assert!(store.resume_pending());
        assert_eq!(file::load_resume(&resume, 4), vec![0]);

        assert!(store.flush_resume().unwrap());
        assert!(!store.resume_pending());
        assert_eq!(file::load_resume(&resume, 4), vec![0, 1]);
        assert!(!store.flush_resume().unwrap());
    }

    #[test]
    fn test_state_queries_proceed_while_disk_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metainfo("busy.mkv", PIECE, &[("busy.mkv", 4 * u64::from(PIECE))], SEED);
        let store = PieceStore::open(
            &meta,
            StoragePolicy::File {
                root: dir.path().join("payload"),
                resume: dir.path().join("busy.resume"),
            },
        )
        .unwrap();
        assert!(fill(&store, &meta, 0));

        let disk = store.disk.lock();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let watcher = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let answers = (
                    store.is_verified(0),
                    store.verified_count(),
                    store.missing_blocks(1, 4096).len(),
                );
                done_tx.send(answers).unwrap();
            })
        };
        let answers = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(answers, (true, 1, 4));
        drop(disk);
        watcher.join().unwrap();
    }

    #[tokio::test]
    async fn test_async_wrappers_round_trip_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metainfo("async.mkv", PIECE, &[("async.mkv", 2 * u64::from(PIECE))], SEED);
        let store = PieceStore::open(
            &meta,
            StoragePolicy::File {
                root: dir.path().join("payload"),
                resume: dir.path().join("async.resume"),
            },
        )
        .unwrap();
        let data = Bytes::from(piece_bytes(&meta, 1));
        assert_eq!(store.put_block(1, 0, data.clone()).await.unwrap(), BlockWrite::PieceFull);
        assert!(store.verify_piece(1).await.unwrap());
        assert_eq!(store.fetch_block(1, 0, PIECE).await.unwrap(), data);
        store.close(false).await.unwrap();
        assert!(matches!(store.fetch_block(1, 0, 1).await, Err(StoreError::TornDown)));
    }

    #[test]
    fn test_file_store_teardown_deletes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metainfo("gone.mkv", PIECE, &[("gone.mkv", 20000)], SEED);
        let root = dir.path().join("payload");
        let resume = dir.path().join("gone.resume");
        let store = PieceStore::open(
            &meta,
            StoragePolicy::File {
                root: root.clone(),
                resume: resume.clone(),
            },
        )
        .unwrap();
        assert!(fill(&store, &meta, 0));
        assert!(resume.exists());
        store.teardown(true).unwrap();
        assert!(!root.exists());
        assert!(!resume.exists());
    }
}
