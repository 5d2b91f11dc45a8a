//! Shared state of one torrent inside the wire engine.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::metadata::MetadataAssembler;
use super::picker::BlockPicker;
use crate::session::{EngineEvent, EventSender, PriorityMap};
use crate::storage::PieceStore;
use crate::torrent::{InfoHash, Metainfo};

/// Peers that failed to connect are not retried for this long.
const RETRY_AFTER: Duration = Duration::from_secs(120);
const FAILED_PEER_MEMORY: usize = 512;

/// Bytes-per-second meter over a rolling one-second window.
#[derive(Debug)]
pub struct RateMeter {
    total: AtomicU64,
    window: Mutex<(Instant, u64, u64)>,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(0),
            window: Mutex::new((Instant::now(), 0, 0)),
        }
    }
}

impl RateMeter {
    pub fn record(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
        let mut window = self.window.lock();
        Self::roll(&mut window);
        window.1 += bytes;
    }

    fn roll(window: &mut (Instant, u64, u64)) {
        let elapsed = window.0.elapsed();
        if elapsed >= Duration::from_secs(1) {
            window.2 = if elapsed >= Duration::from_secs(2) {
                0
            } else {
                (window.1 as f64 / elapsed.as_secs_f64()) as u64
            };
            window.0 = Instant::now();
            window.1 = 0;
        }
    }

    pub fn rate(&self) -> u64 {
        let mut window = self.window.lock();
        Self::roll(&mut window);
        window.2
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Everything peer and tracker tasks share for one torrent.
#[derive(Debug)]
pub struct Swarm {
    pub info_hash: InfoHash,
    pub trackers: Vec<String>,
    metainfo: watch::Sender<Option<Arc<Metainfo>>>,
    metadata: Mutex<Option<MetadataAssembler>>,
    pub store: watch::Sender<Option<Arc<PieceStore>>>,
    pub priorities: watch::Sender<PriorityMap>,
    pub picker: Mutex<BlockPicker>,
    /// Pieces verified locally, re-announced to peers as `have`
    pub haves: broadcast::Sender<u32>,
    connected: Mutex<HashSet<SocketAddr>>,
    failed: Mutex<LruCache<SocketAddr, Instant>>,
    pub downloaded: RateMeter,
    pub uploaded: RateMeter,
    finished: AtomicBool,
    events: EventSender,
    pub cancel: CancellationToken,
}

impl Swarm {
    pub fn new(
        info_hash: InfoHash,
        trackers: Vec<String>,
        metainfo: Option<Arc<Metainfo>>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let piece_count = metainfo.as_ref().map_or(0, |m| m.piece_count());
        let capacity = NonZeroUsize::new(FAILED_PEER_MEMORY).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            info_hash,
            trackers,
            metainfo: watch::channel(metainfo).0,
            metadata: Mutex::new(None),
            store: watch::channel(None).0,
            priorities: watch::channel(PriorityMap::skipped(piece_count)).0,
            picker: Mutex::new(BlockPicker::new()),
            haves: broadcast::channel(256).0,
            connected: Mutex::new(HashSet::new()),
            failed: Mutex::new(LruCache::new(capacity)),
            downloaded: RateMeter::default(),
            uploaded: RateMeter::default(),
            finished: AtomicBool::new(false),
            events,
            cancel,
        })
    }

    pub fn metainfo(&self) -> Option<Arc<Metainfo>> {
        self.metainfo.borrow().clone()
    }

    pub fn current_store(&self) -> Option<Arc<PieceStore>> {
        self.store.borrow().clone()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Announces metadata to the service exactly once.
    pub fn publish_metainfo(&self, metainfo: Arc<Metainfo>) {
        let fresh = self.metainfo.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(Arc::clone(&metainfo));
            true
        });
        if fresh {
            self.priorities
                .send_replace(PriorityMap::skipped(metainfo.piece_count()));
            tracing::info!(info_hash = %self.info_hash, name = %metainfo.name, "Metadata received");
            self.emit(EngineEvent::MetadataReceived {
                info_hash: self.info_hash,
                metainfo,
            });
        }
    }

    /// Starts collecting metadata of `size` bytes unless already underway.
    pub fn begin_metadata(&self, size: usize) {
        if self.metainfo.borrow().is_some() {
            return;
        }
        let mut metadata = self.metadata.lock();
        if metadata.is_none() {
            match MetadataAssembler::new(size) {
                Ok(assembler) => *metadata = Some(assembler),
                Err(e) => tracing::debug!(info_hash = %self.info_hash, "Ignoring metadata offer: {e}"),
            }
        }
    }

    pub fn next_metadata_request(&self) -> Option<u32> {
        if self.metainfo.borrow().is_some() {
            return None;
        }
        self.metadata.lock().as_mut()?.next_request()
    }

    pub fn release_metadata_request(&self, piece: u32) {
        if let Some(assembler) = self.metadata.lock().as_mut() {
            assembler.release(piece);
        }
    }

    /// Accepts one metadata piece; publishes the metainfo once complete and
    /// verified.
    pub fn accept_metadata(&self, piece: u32, total_size: usize, data: Bytes) {
        let info = {
            let mut guard = self.metadata.lock();
            let Some(assembler) = guard.as_mut() else {
                return;
            };
            if !assembler.accept(piece, total_size, data) || !assembler.is_complete() {
                return;
            }
            match assembler.finish(self.info_hash) {
                Some(info) => {
                    *guard = None;
                    info
                }
                None => return,
            }
        };
        match Metainfo::from_info_bytes(&info, self.trackers.clone()) {
            Ok(metainfo) => self.publish_metainfo(Arc::new(metainfo)),
            Err(e) => tracing::warn!(info_hash = %self.info_hash, "Fetched metadata unusable: {e}"),
        }
    }

    /// Registers an outgoing or incoming connection. False when already
    /// connected or over `limit`.
    pub fn try_connect(&self, addr: SocketAddr, limit: usize) -> bool {
        let mut connected = self.connected.lock();
        if connected.len() >= limit || connected.contains(&addr) {
            return false;
        }
        connected.insert(addr)
    }

    pub fn disconnected(&self, addr: SocketAddr) {
        self.connected.lock().remove(&addr);
        self.picker.lock().release_peer(addr);
    }

    pub fn peer_count(&self) -> usize {
        self.connected.lock().len()
    }

    pub fn mark_failed(&self, addr: SocketAddr) {
        self.failed.lock().put(addr, Instant::now());
    }

    pub fn recently_failed(&self, addr: SocketAddr) -> bool {
        self.failed
            .lock()
            .get(&addr)
            .is_some_and(|at| at.elapsed() < RETRY_AFTER)
    }

    /// Emits `TorrentFinished` the first time every piece is downloaded.
    pub fn check_finished(&self, store: &PieceStore) -> bool {
        if store.downloaded_count() as u32 != store.piece_count() {
            return false;
        }
        if !self.finished.swap(true, Ordering::AcqRel) {
            tracing::info!(info_hash = %self.info_hash, "Torrent finished");
            self.emit(EngineEvent::TorrentFinished {
                info_hash: self.info_hash,
            });
        }
        true
    }

    /// Bytes still missing, for tracker announces.
    pub fn left(&self) -> u64 {
        match (self.metainfo(), self.current_store()) {
            (Some(metainfo), Some(store)) => {
                let all = crate::torrent::PieceRange::new(0, metainfo.piece_count());
                metainfo.total_length - store.downloaded_bytes(all)
            }
            (Some(metainfo), None) => metainfo.total_length,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::event_channel;
    use crate::torrent::metainfo::fixtures::metainfo;

    #[test]
    fn test_metadata_is_published_once() {
        let (tx, mut rx) = event_channel();
        let meta = Arc::new(metainfo("m.mkv", 16384, &[("m.mkv", 40000)], 1));
        let swarm = Swarm::new(meta.info_hash, Vec::new(), None, tx, CancellationToken::new());
        swarm.publish_metainfo(Arc::clone(&meta));
        swarm.publish_metainfo(meta);
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::MetadataReceived { .. })));
        assert!(rx.try_recv().is_err());
        assert_eq!(swarm.priorities.borrow().len(), 3);
    }

    #[test]
    fn test_assembled_metadata_becomes_metainfo() {
        let (tx, mut rx) = event_channel();
        let meta = metainfo("m.mkv", 16384, &[("m.mkv", 40000)], 2);
        let swarm = Swarm::new(meta.info_hash, Vec::new(), None, tx, CancellationToken::new());
        let info = meta.info_bytes.clone();
        swarm.begin_metadata(info.len());
        assert_eq!(swarm.next_metadata_request(), Some(0));
        swarm.accept_metadata(0, info.len(), info.clone());
        assert_eq!(swarm.metainfo().map(|m| m.info_hash), Some(meta.info_hash));
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::MetadataReceived { .. })));
        assert_eq!(swarm.next_metadata_request(), None);
    }

    #[test]
    fn test_connection_limit_and_failures() {
        let (tx, _rx) = event_channel();
        let swarm = Swarm::new(InfoHash::new([1; 20]), Vec::new(), None, tx, CancellationToken::new());
        let a = SocketAddr::from(([10, 0, 0, 1], 1));
        let b = SocketAddr::from(([10, 0, 0, 2], 1));
        assert!(swarm.try_connect(a, 1));
        assert!(!swarm.try_connect(a, 5));
        assert!(!swarm.try_connect(b, 1));
        swarm.disconnected(a);
        assert_eq!(swarm.peer_count(), 0);

        swarm.mark_failed(b);
        assert!(swarm.recently_failed(b));
        assert!(!swarm.recently_failed(a));
    }
}
