//! Deterministic in-process swarm.
//!
//! Each torrent runs a task that walks the current priority map in request
//! order and writes synthetic payload blocks into the attached store after a
//! seeded random latency. Content comes from [`synthetic::payload_byte`], so
//! tests can check every byte a reader returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    EngineError, EngineEvent, EventSender, PriorityMap, SessionLifecycle, SessionState,
    SwarmEngine, SwarmStats,
};
use crate::config::NetworkConfig;
use crate::storage::{PieceState, PieceStore, StoreError};
use crate::torrent::synthetic::{self, fill_payload};
use crate::torrent::{InfoHash, Metainfo, Priority, TorrentSource};

const BLOCK_SIZE: u32 = 16 * 1024;

/// Shape and timing of the simulated swarm.
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    /// Payload seed; torrents handed in with metainfo must be built with it
    pub seed: u8,
    /// Torrent name used for synthesized metadata
    pub name: String,
    /// Layout used when only an infohash is known
    pub files: Vec<(String, u64)>,
    pub piece_length: u32,
    pub metadata_delay: Duration,
    pub piece_latency: Duration,
    /// Upper bound of random latency added per piece
    pub jitter: Duration,
    /// Corrupt deliveries to inject per piece before a good copy arrives
    pub hash_failures: HashMap<u32, u32>,
    /// Never deliver metadata for bare infohashes
    pub withhold_metadata: bool,
    pub peers: usize,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            seed: 0x5A,
            name: "Undertow.Sample.2024.1080p.mkv".to_string(),
            files: vec![("Undertow.Sample.2024.1080p.mkv".to_string(), 256 * 1024 * 1024)],
            piece_length: 256 * 1024,
            metadata_delay: Duration::from_millis(50),
            piece_latency: Duration::from_millis(5),
            jitter: Duration::from_millis(5),
            hash_failures: HashMap::new(),
            withhold_metadata: false,
            peers: 12,
        }
    }
}

impl SimulationProfile {
    /// Fast profile for tests.
    pub fn for_testing() -> Self {
        Self {
            metadata_delay: Duration::from_millis(5),
            piece_latency: Duration::from_millis(1),
            jitter: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_files(mut self, name: &str, piece_length: u32, files: &[(&str, u64)]) -> Self {
        self.name = name.to_string();
        self.piece_length = piece_length;
        self.files = files
            .iter()
            .map(|(path, length)| (path.to_string(), *length))
            .collect();
        self
    }

    /// Metainfo the swarm serves for `info_hash` when none was supplied.
    ///
    /// # Errors
    ///
    /// - `EngineError::Protocol` - The profile layout does not form a valid torrent
    pub fn synthesize(&self, info_hash: InfoHash, trackers: Vec<String>) -> Result<Metainfo, EngineError> {
        let files: Vec<(&str, u64)> = self
            .files
            .iter()
            .map(|(path, length)| (path.as_str(), *length))
            .collect();
        let info = synthetic::info_dict(&self.name, self.piece_length, &files, self.seed);
        let mut metainfo = Metainfo::from_info_bytes(&info, trackers).map_err(|e| EngineError::Protocol {
            message: format!("Simulated metadata invalid: {e}"),
        })?;
        metainfo.info_hash = info_hash;
        Ok(metainfo)
    }
}

#[derive(Debug, Default)]
struct Counters {
    downloaded: AtomicU64,
}

#[derive(Debug)]
struct SimTorrent {
    metainfo: Arc<Metainfo>,
    priorities: watch::Sender<PriorityMap>,
    storage: watch::Sender<Option<Arc<PieceStore>>>,
    counters: Arc<Counters>,
    started: Instant,
    cancel: CancellationToken,
}

/// In-process engine serving deterministic content.
#[derive(Debug)]
pub struct SimulatedEngine {
    profile: SimulationProfile,
    events: EventSender,
    lifecycle: SessionLifecycle,
    torrents: Mutex<HashMap<InfoHash, SimTorrent>>,
    batches: Mutex<Vec<(InfoHash, PriorityMap)>>,
    network: Mutex<NetworkConfig>,
    reconfigures: AtomicU64,
    shutdown: CancellationToken,
}

impl SimulatedEngine {
    pub fn new(profile: SimulationProfile, events: EventSender) -> Arc<Self> {
        let engine = Self {
            profile,
            events,
            lifecycle: SessionLifecycle::default(),
            torrents: Mutex::new(HashMap::new()),
            batches: Mutex::new(Vec::new()),
            network: Mutex::new(NetworkConfig::default()),
            reconfigures: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        };
        engine.lifecycle.set(SessionState::Running);
        tracing::info!(seed = engine.profile.seed, "Simulated swarm started");
        Arc::new(engine)
    }

    pub fn profile(&self) -> &SimulationProfile {
        &self.profile
    }

    /// Every priority batch applied to `info_hash`, oldest first.
    pub fn priority_batches(&self, info_hash: InfoHash) -> Vec<PriorityMap> {
        self.batches
            .lock()
            .iter()
            .filter(|(hash, _)| *hash == info_hash)
            .map(|(_, map)| map.clone())
            .collect()
    }

    /// Priority map currently driving `info_hash`.
    pub fn current_priorities(&self, info_hash: InfoHash) -> Option<PriorityMap> {
        self.torrents
            .lock()
            .get(&info_hash)
            .map(|torrent| torrent.priorities.borrow().clone())
    }

    pub fn contains(&self, info_hash: InfoHash) -> bool {
        self.torrents.lock().contains_key(&info_hash)
    }

    pub fn reconfigure_count(&self) -> u64 {
        self.reconfigures.load(Ordering::Relaxed)
    }

    pub fn network_config(&self) -> NetworkConfig {
        self.network.lock().clone()
    }

    fn with_torrent<T>(
        &self,
        info_hash: InfoHash,
        f: impl FnOnce(&SimTorrent) -> T,
    ) -> Result<T, EngineError> {
        self.torrents
            .lock()
            .get(&info_hash)
            .map(f)
            .ok_or(EngineError::TorrentNotFound { info_hash })
    }
}

#[async_trait]
impl SwarmEngine for SimulatedEngine {
    async fn add_torrent(&self, source: TorrentSource) -> Result<(), EngineError> {
        self.lifecycle.ensure_running()?;
        let info_hash = source.info_hash();
        if self.contains(info_hash) {
            return Ok(());
        }

        let (metainfo, delay) = match source.metainfo() {
            Some(metainfo) => (Arc::clone(metainfo), None),
            None => (
                Arc::new(self.profile.synthesize(info_hash, source.trackers().to_vec())?),
                Some(self.profile.metadata_delay),
            ),
        };

        let piece_count = metainfo.piece_count();
        let (priorities, priorities_rx) = watch::channel(PriorityMap::skipped(piece_count));
        let (storage, storage_rx) = watch::channel(None);
        let counters = Arc::new(Counters::default());
        let cancel = self.shutdown.child_token();

        let task = TorrentTask {
            info_hash,
            metainfo: Arc::clone(&metainfo),
            metadata_delay: delay,
            withhold_metadata: self.profile.withhold_metadata && delay.is_some(),
            seed: self.profile.seed,
            latency: self.profile.piece_latency,
            jitter: self.profile.jitter,
            failures: self.profile.hash_failures.clone(),
            events: self.events.clone(),
            priorities: priorities_rx,
            storage: storage_rx,
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            rng: ChaCha8Rng::from_seed(seed_for(info_hash)),
        };

        self.torrents.lock().insert(
            info_hash,
            SimTorrent {
                metainfo,
                priorities,
                storage,
                counters,
                started: Instant::now(),
                cancel,
            },
        );
        tokio::spawn(task.run());
        tracing::debug!(info_hash = %info_hash, "Simulated torrent added");
        Ok(())
    }

    async fn attach_storage(&self, info_hash: InfoHash, store: Arc<PieceStore>) -> Result<(), EngineError> {
        self.with_torrent(info_hash, |torrent| {
            torrent.storage.send_replace(Some(store));
        })
    }

    async fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        if let Some(torrent) = self.torrents.lock().remove(&info_hash) {
            torrent.cancel.cancel();
            tracing::debug!(info_hash = %info_hash, "Simulated torrent removed");
        }
        Ok(())
    }

    async fn set_piece_priority(&self, info_hash: InfoHash, piece: u32, priority: Priority) -> Result<(), EngineError> {
        self.with_torrent(info_hash, |torrent| {
            torrent.priorities.send_modify(|map| map.set(piece, priority));
        })
    }

    async fn set_piece_deadline(&self, info_hash: InfoHash, piece: u32, deadline: Duration) -> Result<(), EngineError> {
        self.with_torrent(info_hash, |torrent| {
            torrent
                .priorities
                .send_modify(|map| map.set_deadline(piece, deadline));
        })
    }

    async fn apply_priorities(&self, info_hash: InfoHash, map: PriorityMap) -> Result<(), EngineError> {
        self.with_torrent(info_hash, |torrent| {
            torrent.priorities.send_replace(map.clone());
        })?;
        self.batches.lock().push((info_hash, map));
        Ok(())
    }

    async fn piece_state(&self, info_hash: InfoHash, piece: u32) -> Result<PieceState, EngineError> {
        self.with_torrent(info_hash, |torrent| match torrent.storage.borrow().as_ref() {
            Some(store) => store.state(piece),
            None => PieceState::Absent,
        })
    }

    async fn stats(&self, info_hash: InfoHash) -> Result<SwarmStats, EngineError> {
        let peers = self.profile.peers;
        self.with_torrent(info_hash, |torrent| {
            let downloaded = torrent.counters.downloaded.load(Ordering::Relaxed);
            let elapsed = torrent.started.elapsed().as_millis().max(1) as u64;
            let finished = torrent
                .storage
                .borrow()
                .as_ref()
                .is_some_and(|store| store.downloaded_count() as u32 == torrent.metainfo.piece_count());
            SwarmStats {
                download_rate: if finished { 0 } else { downloaded * 1000 / elapsed },
                upload_rate: 0,
                peers,
                downloaded,
                uploaded: 0,
            }
        })
    }

    async fn reconfigure(&self, config: &NetworkConfig) -> Result<(), EngineError> {
        self.lifecycle.ensure_running()?;
        self.lifecycle.set(SessionState::Reconfiguring);
        *self.network.lock() = config.clone();
        self.reconfigures.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
        self.lifecycle.set(SessionState::Running);
        Ok(())
    }

    fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.lifecycle.set(SessionState::Stopping);
        self.shutdown.cancel();
        self.torrents.lock().clear();
        self.lifecycle.set(SessionState::Stopped);
        Ok(())
    }
}

fn seed_for(info_hash: InfoHash) -> [u8; 32] {
    let mut seed = [0u8; 32];
    seed[..20].copy_from_slice(info_hash.as_bytes());
    seed
}

enum Delivery {
    Done,
    Refused,
    Closed,
}

struct TorrentTask {
    info_hash: InfoHash,
    metainfo: Arc<Metainfo>,
    metadata_delay: Option<Duration>,
    withhold_metadata: bool,
    seed: u8,
    latency: Duration,
    jitter: Duration,
    failures: HashMap<u32, u32>,
    events: EventSender,
    priorities: watch::Receiver<PriorityMap>,
    storage: watch::Receiver<Option<Arc<PieceStore>>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    rng: ChaCha8Rng,
}

impl TorrentTask {
    async fn run(mut self) {
        if let Some(delay) = self.metadata_delay {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.withhold_metadata {
                tracing::debug!(info_hash = %self.info_hash, "Withholding metadata");
                self.cancel.cancelled().await;
                return;
            }
        }
        let _ = self.events.send(EngineEvent::MetadataReceived {
            info_hash: self.info_hash,
            metainfo: Arc::clone(&self.metainfo),
        });

        let Some(store) = self.wait_for_storage().await else {
            return;
        };
        let mut completions = store.subscribe();
        let piece_count = self.metainfo.piece_count();
        let mut finished = false;

        loop {
            if self.cancel.is_cancelled() || store.is_torn_down() {
                return;
            }
            if !finished && store.downloaded_count() as u32 == piece_count {
                finished = true;
                let _ = self.events.send(EngineEvent::TorrentFinished {
                    info_hash: self.info_hash,
                });
            }

            let next = self
                .priorities
                .borrow_and_update()
                .request_order()
                .into_iter()
                .find(|piece| !store.is_verified(*piece));

            let idle = match next {
                Some(piece) => match self.deliver(&store, piece).await {
                    Delivery::Done => false,
                    Delivery::Refused => true,
                    Delivery::Closed => return,
                },
                None => true,
            };

            if idle {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = self.priorities.changed() => if changed.is_err() { return },
                    changed = completions.changed() => if changed.is_err() { return },
                }
            }
        }
    }

    async fn wait_for_storage(&mut self) -> Option<Arc<PieceStore>> {
        loop {
            if let Some(store) = self.storage.borrow_and_update().as_ref() {
                return Some(Arc::clone(store));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = self.storage.changed() => changed.ok()?,
            }
        }
    }

    async fn deliver(&mut self, store: &Arc<PieceStore>, piece: u32) -> Delivery {
        let jitter_ms = self.jitter.as_millis() as u64;
        let delay = self.latency + Duration::from_millis(self.rng.random_range(0..=jitter_ms));
        tokio::select! {
            _ = self.cancel.cancelled() => return Delivery::Closed,
            _ = tokio::time::sleep(delay) => {}
        }

        let mut corrupt = match self.failures.get_mut(&piece) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        let start = u64::from(piece) * u64::from(self.metainfo.piece_length);
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        for gap in store.missing_blocks(piece, BLOCK_SIZE) {
            let data = &mut block[..(gap.end - gap.start) as usize];
            fill_payload(self.seed, start + u64::from(gap.start), data);
            if corrupt {
                data[0] ^= 0xFF;
                corrupt = false;
            }
            let length = data.len() as u64;
            match store.put_block(piece, gap.start, Bytes::copy_from_slice(data)).await {
                Ok(_) => {
                    self.counters.downloaded.fetch_add(length, Ordering::Relaxed);
                }
                Err(StoreError::EvictionRefused { .. }) => {
                    tracing::trace!(info_hash = %self.info_hash, piece, "Block dropped, no free slot");
                    return Delivery::Refused;
                }
                Err(StoreError::TornDown) => return Delivery::Closed,
                Err(e @ StoreError::StorageFull { .. }) => {
                    tracing::warn!(info_hash = %self.info_hash, piece, "Block write failed: {e}");
                    let _ = self.events.send(EngineEvent::StorageFailed {
                        info_hash: self.info_hash,
                        message: e.to_string(),
                    });
                    return Delivery::Refused;
                }
                Err(e) => {
                    tracing::warn!(info_hash = %self.info_hash, piece, "Block write failed: {e}");
                    return Delivery::Refused;
                }
            }
        }

        if store.state(piece) != PieceState::Present {
            return Delivery::Done;
        }
        let event = match store.verify_piece(piece).await {
            Ok(true) => EngineEvent::PieceCompleted {
                info_hash: self.info_hash,
                piece,
            },
            Ok(false) => EngineEvent::PieceHashFailed {
                info_hash: self.info_hash,
                piece,
            },
            Err(StoreError::TornDown) => return Delivery::Closed,
            Err(e) => {
                tracing::debug!(info_hash = %self.info_hash, piece, "Completion skipped: {e}");
                return Delivery::Done;
            }
        };
        let _ = self.events.send(event);
        Delivery::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::event_channel;
    use crate::storage::StoragePolicy;
    use crate::torrent::synthetic::payload_byte;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    fn bare(byte: u8) -> TorrentSource {
        TorrentSource::Bare {
            info_hash: hash(byte),
            name: None,
            trackers: Vec::new(),
        }
    }

    fn small_profile() -> SimulationProfile {
        SimulationProfile::for_testing().with_files("clip.mkv", 16384, &[("clip.mkv", 5 * 16384 + 77)])
    }

    async fn metadata(events: &mut crate::session::EventReceiver) -> Arc<Metainfo> {
        loop {
            match events.recv().await {
                Some(EngineEvent::MetadataReceived { metainfo, .. }) => return metainfo,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_bare_infohash_gets_synthetic_metadata() {
        let (tx, mut rx) = event_channel();
        let engine = SimulatedEngine::new(small_profile(), tx);
        engine.add_torrent(bare(1)).await.unwrap();
        engine.add_torrent(bare(1)).await.unwrap();

        let metainfo = metadata(&mut rx).await;
        assert_eq!(metainfo.info_hash, hash(1));
        assert_eq!(metainfo.piece_count(), 6);
        assert_eq!(metainfo.total_length, 5 * 16384 + 77);
    }

    #[tokio::test]
    async fn test_delivers_wanted_pieces_only() {
        let (tx, mut rx) = event_channel();
        let engine = SimulatedEngine::new(small_profile(), tx);
        engine.add_torrent(bare(2)).await.unwrap();
        let metainfo = metadata(&mut rx).await;
        let store = PieceStore::open(&metainfo, StoragePolicy::Memory { budget: 1 << 20 }).unwrap();
        engine.attach_storage(hash(2), Arc::clone(&store)).await.unwrap();

        let mut map = PriorityMap::skipped(metainfo.piece_count());
        map.set(5, Priority::Now);
        map.set(1, Priority::High);
        engine.apply_priorities(hash(2), map).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), store.await_piece(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), store.await_piece(1))
            .await
            .unwrap()
            .unwrap();
        assert!(!store.is_verified(0));

        let last = store.read_block(5, 0, 77).unwrap();
        let expected: Vec<u8> = (0..77).map(|i| payload_byte(0x5A, 5 * 16384 + i)).collect();
        assert_eq!(last.as_ref(), &expected[..]);
        assert_eq!(engine.priority_batches(hash(2)).len(), 1);
    }

    #[tokio::test]
    async fn test_injected_hash_failure_is_reported_then_recovered() {
        let mut profile = small_profile();
        profile.hash_failures.insert(0, 2);
        let (tx, mut rx) = event_channel();
        let engine = SimulatedEngine::new(profile, tx);
        engine.add_torrent(bare(3)).await.unwrap();
        let metainfo = metadata(&mut rx).await;
        let store = PieceStore::open(&metainfo, StoragePolicy::Memory { budget: 1 << 20 }).unwrap();
        engine.attach_storage(hash(3), Arc::clone(&store)).await.unwrap();
        engine.set_piece_priority(hash(3), 0, Priority::Now).await.unwrap();

        let mut failures = 0;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
                Some(EngineEvent::PieceHashFailed { piece: 0, .. }) => failures += 1,
                Some(EngineEvent::PieceCompleted { piece: 0, .. }) => break,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
        assert_eq!(failures, 2);
        assert!(store.is_verified(0));
    }

    #[tokio::test]
    async fn test_reconfigure_and_shutdown_lifecycle() {
        let (tx, _rx) = event_channel();
        let engine = SimulatedEngine::new(small_profile(), tx);
        assert_eq!(engine.state(), SessionState::Running);

        let mut network = NetworkConfig::default();
        network.download_limit = Some(1024);
        engine.reconfigure(&network).await.unwrap();
        assert_eq!(engine.state(), SessionState::Running);
        assert_eq!(engine.network_config().download_limit, Some(1024));

        engine.shutdown().await.unwrap();
        assert_eq!(engine.state(), SessionState::Stopped);
        assert!(engine.add_torrent(bare(4)).await.is_err());
    }
}
