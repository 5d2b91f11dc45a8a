//! Head and tail windows, piece priorities and the buffering gate.
//!
//! One controller exists per torrent with metadata. Every attached reader
//! owns a head window starting at the piece under its read offset; the tail
//! window covers the last pieces of the playback file and is fixed once the
//! file is chosen. The controller turns these windows into a complete
//! [`PriorityMap`] that the torrent hands to the engine in one batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::config::BufferConfig;
use crate::session::PriorityMap;
use crate::storage::PieceStore;
use crate::torrent::{FileEntry, PieceRange, Priority};

/// Identity of one reader attached to a torrent.
pub type ReaderId = Uuid;

/// Piece span of the file a reader reads, in torrent-absolute terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSpan {
    offset: u64,
    length: u64,
    pieces: PieceRange,
}

impl FileSpan {
    fn of(file: &FileEntry, piece_length: u32) -> Self {
        Self {
            offset: file.offset,
            length: file.length,
            pieces: file.pieces(piece_length),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ReaderWindow {
    file: FileSpan,
    /// Torrent-absolute byte offset of the next read
    position: u64,
    head: PieceRange,
    seeked: bool,
}

/// Observable view of one reader's windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaderView {
    pub position: u64,
    pub head_start: u32,
    pub head_end: u32,
    pub seeked: bool,
}

/// Per-torrent window bookkeeping.
#[derive(Debug, Clone)]
pub struct BufferController {
    config: BufferConfig,
    piece_length: u32,
    piece_count: u32,
    playback: FileSpan,
    head_len: u32,
    /// Slot count of a memory store; the union of heads and tail fits in it
    capacity: Option<usize>,
    tail: PieceRange,
    /// Head armed at the start of the playback file while no reader is attached
    idle_head: PieceRange,
    readers: BTreeMap<ReaderId, ReaderWindow>,
    paused: bool,
    failures: HashMap<u32, u32>,
    stalled: BTreeSet<u32>,
}

impl BufferController {
    /// Arms windows for `playback`. `capacity` is the slot count of a memory
    /// store; head and tail are shrunk so that both fit at once.
    pub fn new(
        config: &BufferConfig,
        piece_length: u32,
        piece_count: u32,
        playback: &FileEntry,
        capacity: Option<usize>,
    ) -> Self {
        let playback = FileSpan::of(playback, piece_length);
        let (head_len, tail_len) = window_lengths(config, piece_length, playback.pieces.len(), capacity);
        let tail = PieceRange::new(playback.pieces.end - tail_len, playback.pieces.end);
        let mut controller = Self {
            config: config.clone(),
            piece_length,
            piece_count,
            playback,
            head_len,
            capacity,
            tail,
            idle_head: PieceRange::empty(),
            readers: BTreeMap::new(),
            paused: false,
            failures: HashMap::new(),
            stalled: BTreeSet::new(),
        };
        controller.idle_head = controller.head_at(&playback, playback.offset);
        tracing::debug!(
            head_len,
            tail = %controller.tail,
            file_pieces = %playback.pieces,
            "Buffer windows armed"
        );
        controller
    }

    /// Picks up new tuning. The tail window keeps its length.
    pub fn reconfigure(&mut self, config: &BufferConfig, capacity: Option<usize>) {
        let (head_len, _) = window_lengths(config, self.piece_length, self.playback.pieces.len(), capacity);
        self.config = config.clone();
        self.capacity = capacity;
        self.head_len = match capacity {
            Some(slots) => head_len.min((slots as u32).saturating_sub(self.tail.len())).max(1),
            None => head_len,
        };
        self.refresh_heads();
    }

    /// Switches the playback file, re-arming the tail at its end. Attached
    /// readers keep their positions.
    pub fn set_playback(&mut self, playback: &FileEntry, capacity: Option<usize>) {
        let playback = FileSpan::of(playback, self.piece_length);
        let (head_len, tail_len) = window_lengths(&self.config, self.piece_length, playback.pieces.len(), capacity);
        self.playback = playback;
        self.head_len = head_len;
        self.capacity = capacity;
        self.tail = PieceRange::new(playback.pieces.end - tail_len, playback.pieces.end);
        self.refresh_heads();
    }

    fn refresh_heads(&mut self) {
        let playback = self.playback;
        self.idle_head = self.head_at(&playback, playback.offset);
        let heads: Vec<(ReaderId, PieceRange)> = self
            .readers
            .iter()
            .map(|(id, window)| (*id, self.head_at(&window.file, window.position)))
            .collect();
        for (id, head) in heads {
            if let Some(window) = self.readers.get_mut(&id) {
                window.head = head;
            }
        }
    }

    fn head_at(&self, file: &FileSpan, position: u64) -> PieceRange {
        if file.pieces.is_empty() {
            return PieceRange::empty();
        }
        let last_byte = file.offset + file.length.saturating_sub(1);
        let position = position.clamp(file.offset, last_byte);
        let start = (position / u64::from(self.piece_length)) as u32;
        let end = start.saturating_add(self.reader_head_len()).min(file.pieces.end);
        PieceRange::new(start, end)
    }

    pub fn head_len(&self) -> u32 {
        self.head_len
    }

    /// Head length of each attached reader. Under a memory store the slots
    /// left beside the tail are split evenly between readers, never below one.
    fn reader_head_len(&self) -> u32 {
        match self.capacity {
            Some(slots) if self.readers.len() > 1 => {
                let free = (slots as u32).saturating_sub(self.tail.len());
                self.head_len.min(free / self.readers.len() as u32).max(1)
            }
            _ => self.head_len,
        }
    }

    pub fn tail(&self) -> PieceRange {
        self.tail
    }

    pub fn playback_pieces(&self) -> PieceRange {
        self.playback.pieces
    }

    /// Registers a reader of `file` positioned at file offset `offset`.
    pub fn attach(&mut self, id: ReaderId, file: &FileEntry, offset: u64) {
        let span = FileSpan::of(file, self.piece_length);
        let position = span.offset + offset;
        self.readers.insert(
            id,
            ReaderWindow {
                file: span,
                position,
                head: PieceRange::empty(),
                seeked: offset > 0,
            },
        );
        self.refresh_heads();
    }

    pub fn detach(&mut self, id: ReaderId) -> bool {
        let removed = self.readers.remove(&id).is_some();
        if removed {
            self.refresh_heads();
        }
        removed
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Moves a reader to file offset `offset`. Returns whether its head
    /// window changed.
    pub fn seek(&mut self, id: ReaderId, offset: u64) -> bool {
        self.relocate(id, offset, true)
    }

    /// Records sequential progress of a reader.
    pub fn advance(&mut self, id: ReaderId, offset: u64) -> bool {
        self.relocate(id, offset, false)
    }

    fn relocate(&mut self, id: ReaderId, offset: u64, seek: bool) -> bool {
        let Some(window) = self.readers.get(&id).copied() else {
            return false;
        };
        let position = window.file.offset + offset;
        let head = self.head_at(&window.file, position);
        if let Some(window) = self.readers.get_mut(&id) {
            window.position = position;
            window.seeked |= seek;
            let moved = window.head != head;
            window.head = head;
            return moved;
        }
        false
    }

    pub fn head_of(&self, id: ReaderId) -> Option<PieceRange> {
        self.readers.get(&id).map(|window| window.head)
    }

    pub fn reader_view(&self, id: ReaderId) -> Option<ReaderView> {
        self.readers.get(&id).map(|window| ReaderView {
            position: window.position,
            head_start: window.head.start,
            head_end: window.head.end,
            seeked: window.seeked,
        })
    }

    /// Active head windows; the idle head stands in while nobody reads.
    pub fn heads(&self) -> Vec<PieceRange> {
        if self.readers.is_empty() {
            return vec![self.idle_head];
        }
        self.readers.values().map(|window| window.head).collect()
    }

    /// Union of heads and tail, for store protection and sweeping.
    pub fn windows(&self) -> Vec<PieceRange> {
        let mut windows = self.heads();
        if !self.tail.is_empty() {
            windows.push(self.tail);
        }
        windows.retain(|range| !range.is_empty());
        windows
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Full priority assignment for the engine.
    pub fn compute_map(&self) -> PriorityMap {
        let mut map = PriorityMap::skipped(self.piece_count);
        let heads = self.heads();
        if self.paused {
            for head in heads {
                map.set_range(head, Priority::Normal);
            }
            return map;
        }

        let step = u64::from(self.config.deadline_step_ms);
        for head in heads {
            for (distance, piece) in head.iter().enumerate() {
                let priority = if self.stalled.contains(&piece) || distance as u32 >= self.config.urgent_pieces {
                    Priority::High
                } else {
                    Priority::Now
                };
                map.raise(piece, priority);
                map.set_deadline(piece, Duration::from_millis(step * distance as u64));
            }
        }
        for piece in self.tail.iter() {
            map.raise(piece, Priority::High);
        }
        map
    }

    /// Clears failure history of a verified piece. Returns whether the piece
    /// lies in a head window, i.e. whether priorities need reconciling.
    pub fn on_piece_complete(&mut self, piece: u32) -> bool {
        self.failures.remove(&piece);
        let was_stalled = self.stalled.remove(&piece);
        was_stalled || self.heads().iter().any(|head| head.contains(piece))
    }

    /// Counts a hash failure. Returns true when the piece just crossed the
    /// stall threshold.
    pub fn on_hash_failure(&mut self, piece: u32) -> bool {
        let count = self.failures.entry(piece).or_insert(0);
        *count += 1;
        if *count >= self.config.hash_failure_threshold.max(1) {
            return self.stalled.insert(piece);
        }
        false
    }

    pub fn is_stalled(&self) -> bool {
        !self.stalled.is_empty()
    }

    /// Whether every head and the tail are verified.
    pub fn is_complete(&self, store: &PieceStore) -> bool {
        self.windows().into_iter().all(|range| store.all_verified(range))
    }

    /// Gate for a reader's first read: its head and the tail verified.
    /// Always open when gating is disabled.
    pub fn is_buffered(&self, id: ReaderId, store: &PieceStore) -> bool {
        if !self.config.gate_reads_on_buffer {
            return true;
        }
        let Some(window) = self.readers.get(&id) else {
            return self.is_complete(store);
        };
        let under_offset = (window.position / u64::from(self.piece_length)) as u32;
        (window.head.is_empty() || store.is_verified(under_offset))
            && store.all_verified(window.head)
            && store.all_verified(self.tail)
    }
}

/// Head and tail lengths in pieces. With a memory store of `capacity`
/// slots, the tail takes at most half and the head the rest.
fn window_lengths(config: &BufferConfig, piece_length: u32, file_pieces: u32, capacity: Option<usize>) -> (u32, u32) {
    let piece_length = u64::from(piece_length.max(1));
    let head = config.effective_buffer_size().div_ceil(piece_length).max(1);
    let tail = config.tail_size.div_ceil(piece_length);
    let mut head = (head.min(u64::from(file_pieces)) as u32).max(1);
    let mut tail = tail.min(u64::from(file_pieces)) as u32;
    if let Some(slots) = capacity {
        let slots = slots as u32;
        tail = if slots < 2 { 0 } else { tail.min(slots / 2) };
        head = head.min(slots.saturating_sub(tail)).max(1);
    }
    (head, tail)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::StoragePolicy;
    use crate::torrent::metainfo::fixtures::metainfo;

    const PIECE: u32 = 16384;

    fn config() -> BufferConfig {
        BufferConfig {
            buffer_size: 4 * u64::from(PIECE),
            host_cache_size: 0,
            tail_size: 2 * u64::from(PIECE),
            urgent_pieces: 2,
            deadline_step_ms: 10,
            hash_failure_threshold: 2,
            gate_reads_on_buffer: true,
        }
    }

    fn single(length: u64) -> Vec<FileEntry> {
        FileEntry::layout([(vec!["movie.mkv".to_string()], length)])
    }

    #[test]
    fn test_windows_and_priorities() {
        let files = single(20 * u64::from(PIECE));
        let mut controller = BufferController::new(&config(), PIECE, 20, &files[0], None);
        assert_eq!(controller.tail(), PieceRange::new(18, 20));
        assert_eq!(controller.heads(), vec![PieceRange::new(0, 4)]);

        let reader = Uuid::new_v4();
        controller.attach(reader, &files[0], 5 * u64::from(PIECE) + 3);
        assert_eq!(controller.head_of(reader), Some(PieceRange::new(5, 9)));

        let map = controller.compute_map();
        assert_eq!(map.priority(5), Priority::Now);
        assert_eq!(map.priority(6), Priority::Now);
        assert_eq!(map.priority(7), Priority::High);
        assert_eq!(map.priority(9), Priority::Skipped);
        assert_eq!(map.priority(19), Priority::High);
        assert_eq!(map.priority(0), Priority::Skipped);
        assert_eq!(map.deadline(5), Some(Duration::ZERO));
        assert_eq!(map.deadline(8), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_repeated_seek_yields_identical_maps() {
        let files = single(50 * u64::from(PIECE));
        let mut controller = BufferController::new(&config(), PIECE, 50, &files[0], None);
        let reader = Uuid::new_v4();
        controller.attach(reader, &files[0], 0);

        assert!(controller.seek(reader, 30 * u64::from(PIECE)));
        let first = controller.compute_map();
        assert!(!controller.seek(reader, 30 * u64::from(PIECE)));
        assert_eq!(controller.compute_map(), first);
        assert_eq!(first.priority(0), Priority::Skipped);
        assert_eq!(first.priority(30), Priority::Now);
        assert_eq!(controller.reader_view(reader).map(|view| view.seeked), Some(true));
    }

    #[test]
    fn test_union_of_heads_for_concurrent_readers() {
        let files = single(40 * u64::from(PIECE));
        let mut controller = BufferController::new(&config(), PIECE, 40, &files[0], None);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        controller.attach(a, &files[0], 0);
        controller.attach(b, &files[0], 20 * u64::from(PIECE));
        let map = controller.compute_map();
        for piece in (0..4).chain(20..24).chain(38..40) {
            assert_ne!(map.priority(piece), Priority::Skipped, "piece {piece}");
        }
        assert_eq!(map.count(Priority::Skipped), 40 - 10);

        controller.detach(a);
        assert_eq!(controller.compute_map().priority(0), Priority::Skipped);
    }

    #[test]
    fn test_paused_keeps_only_heads_at_normal() {
        let files = single(20 * u64::from(PIECE));
        let mut controller = BufferController::new(&config(), PIECE, 20, &files[0], None);
        controller.set_paused(true);
        let map = controller.compute_map();
        assert_eq!(map.count(Priority::Normal), 4);
        assert_eq!(map.priority(19), Priority::Skipped);
        assert_eq!(map.deadline(0), None);
    }

    #[test]
    fn test_memory_capacity_clamps_windows() {
        let files = single(100 * u64::from(PIECE));
        let controller = BufferController::new(&config(), PIECE, 100, &files[0], Some(4));
        assert_eq!(controller.head_len() + controller.tail().len(), 4);

        let single_slot = BufferController::new(&config(), PIECE, 100, &files[0], Some(1));
        assert_eq!(single_slot.head_len(), 1);
        assert!(single_slot.tail().is_empty());
    }

    #[test]
    fn test_concurrent_heads_share_memory_slots() {
        let files = single(40 * u64::from(PIECE));
        let mut controller = BufferController::new(&config(), PIECE, 40, &files[0], Some(6));
        assert_eq!(controller.head_len(), 4);
        assert_eq!(controller.tail().len(), 2);

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        controller.attach(a, &files[0], 0);
        assert_eq!(controller.head_of(a), Some(PieceRange::new(0, 4)));
        controller.attach(b, &files[0], 20 * u64::from(PIECE));
        assert_eq!(controller.head_of(a), Some(PieceRange::new(0, 2)));
        assert_eq!(controller.head_of(b), Some(PieceRange::new(20, 22)));
        let protected: u32 = controller.windows().iter().map(|range| range.len()).sum();
        assert!(protected <= 6, "{protected} protected pieces for 6 slots");

        controller.detach(b);
        assert_eq!(controller.head_of(a), Some(PieceRange::new(0, 4)));
    }

    #[test]
    fn test_stalled_piece_decays_to_high() {
        let files = single(20 * u64::from(PIECE));
        let mut controller = BufferController::new(&config(), PIECE, 20, &files[0], None);
        assert!(!controller.on_hash_failure(0));
        assert!(controller.on_hash_failure(0));
        assert!(!controller.on_hash_failure(0));
        assert!(controller.is_stalled());
        assert_eq!(controller.compute_map().priority(0), Priority::High);

        assert!(controller.on_piece_complete(0));
        assert!(!controller.is_stalled());
        assert_eq!(controller.compute_map().priority(0), Priority::Now);
    }

    #[test]
    fn test_reconfigure_keeps_tail() {
        let files = single(40 * u64::from(PIECE));
        let mut controller = BufferController::new(&config(), PIECE, 40, &files[0], None);
        let bigger = BufferConfig {
            buffer_size: 8 * u64::from(PIECE),
            tail_size: 6 * u64::from(PIECE),
            ..config()
        };
        controller.reconfigure(&bigger, None);
        assert_eq!(controller.head_len(), 8);
        assert_eq!(controller.tail(), PieceRange::new(38, 40));
    }

    #[test]
    fn test_tail_disabled_and_multi_file_reader() {
        let files = FileEntry::layout([
            (vec!["a.mkv".to_string()], 10 * u64::from(PIECE)),
            (vec!["b.srt".to_string()], 100),
        ]);
        let no_tail = BufferConfig {
            tail_size: 0,
            ..config()
        };
        let mut controller = BufferController::new(&no_tail, PIECE, 11, &files[0], None);
        assert!(controller.tail().is_empty());

        let reader = Uuid::new_v4();
        controller.attach(reader, &files[1], 0);
        assert_eq!(controller.head_of(reader), Some(PieceRange::new(10, 11)));
    }

    #[test]
    fn test_gate_waits_for_head_and_tail() {
        let meta = metainfo("movie.mkv", PIECE, &[("movie.mkv", 10 * u64::from(PIECE))], 3);
        let store: Arc<PieceStore> = PieceStore::open(&meta, StoragePolicy::Memory { budget: 1 << 20 }).unwrap();
        let mut controller = BufferController::new(&config(), PIECE, 10, &meta.files[0], store.capacity());
        let reader = Uuid::new_v4();
        controller.attach(reader, &meta.files[0], 0);
        assert!(!controller.is_buffered(reader, &store));

        for piece in [0, 1, 2, 3, 8, 9] {
            let mut buf = vec![0u8; PIECE as usize];
            crate::torrent::synthetic::fill_payload(3, u64::from(piece) * u64::from(PIECE), &mut buf);
            store.write_block(piece, 0, &buf).unwrap();
            assert!(store.on_piece_complete(piece).unwrap());
        }
        assert!(controller.is_buffered(reader, &store));
        assert!(controller.is_complete(&store));
    }
}
