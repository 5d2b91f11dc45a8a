//! BitTorrent engine speaking the peer wire protocol.
//!
//! Each torrent gets a [`swarm::Swarm`] with a driver task that announces to
//! its trackers and dials the returned peers. Inbound connections arrive on
//! one listener shared by every torrent and are routed by infohash. Peers
//! fetch metadata over ut_metadata for bare sources and request blocks in
//! the order given by the torrent's [`PriorityMap`].

pub mod metadata;
pub mod peer;
pub mod picker;
pub mod protocol;
pub mod swarm;
pub mod token_bucket;
pub mod tracker;
pub mod udp_tracker;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use self::peer::{PeerLimits, run_peer};
use self::protocol::{Handshake, PeerId, exchange_handshake, read_handshake};
use self::swarm::Swarm;
use self::token_bucket::RateLimiter;
use self::tracker::{Announce, AnnounceEvent};
use super::{
    EngineError, EngineEvent, EventSender, PriorityMap, SessionLifecycle, SessionState,
    SwarmEngine, SwarmStats,
};
use crate::config::NetworkConfig;
use crate::storage::{PieceState, PieceStore};
use crate::torrent::{InfoHash, Priority, TorrentSource};

/// Re-announce interval when every tracker failed.
const RETRY_INTERVAL: Duration = Duration::from_secs(60);
const MAX_INTERVAL: Duration = Duration::from_secs(30 * 60);
const NUMWANT: u32 = 50;

struct Listener {
    addr: SocketAddr,
    cancel: CancellationToken,
}

struct Shared {
    peer_id: PeerId,
    events: EventSender,
    lifecycle: SessionLifecycle,
    client: reqwest::Client,
    config: Mutex<NetworkConfig>,
    limits: PeerLimits,
    swarms: Mutex<HashMap<InfoHash, Arc<Swarm>>>,
    listener: Mutex<Option<Listener>>,
    shutdown: CancellationToken,
}

/// Engine backed by real peers and trackers.
pub struct WireEngine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WireEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireEngine")
            .field("state", &self.shared.lifecycle.get())
            .field("torrents", &self.shared.swarms.lock().len())
            .finish()
    }
}

impl WireEngine {
    /// Starts the engine and its inbound listener.
    ///
    /// A listener that cannot bind is logged and skipped; outbound
    /// connections still work.
    pub async fn start(config: &NetworkConfig, events: EventSender) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let shared = Arc::new(Shared {
            peer_id: PeerId::generate(),
            events,
            lifecycle: SessionLifecycle::default(),
            client,
            config: Mutex::new(config.clone()),
            limits: PeerLimits {
                download: Arc::new(RateLimiter::new(config.download_limit)),
                upload: Arc::new(RateLimiter::new(config.upload_limit)),
            },
            swarms: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        if let Err(e) = bind_listener(&shared, config).await {
            tracing::warn!(
                port = config.listen_port,
                "Peer listener unavailable, continuing outbound only: {e}"
            );
        }
        shared.lifecycle.set(SessionState::Running);
        tracing::info!(peer_id = %hex::encode(&shared.peer_id.as_bytes()[..8]), "Wire engine started");
        Arc::new(Self { shared })
    }

    /// Address of the inbound listener, if bound.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.lock().as_ref().map(|listener| listener.addr)
    }

    /// Dials a peer for `info_hash` directly, bypassing trackers.
    ///
    /// # Errors
    ///
    /// - `EngineError::TorrentNotFound` - Torrent not in session
    pub fn add_peer(&self, info_hash: InfoHash, addr: SocketAddr) -> Result<(), EngineError> {
        let swarm = self.swarm(info_hash)?;
        connect_peer(&self.shared, &swarm, addr);
        Ok(())
    }

    fn swarm(&self, info_hash: InfoHash) -> Result<Arc<Swarm>, EngineError> {
        self.shared
            .swarms
            .lock()
            .get(&info_hash)
            .cloned()
            .ok_or(EngineError::TorrentNotFound { info_hash })
    }

    fn swarm_with_metadata(&self, info_hash: InfoHash) -> Result<Arc<Swarm>, EngineError> {
        let swarm = self.swarm(info_hash)?;
        if swarm.metainfo().is_none() {
            return Err(EngineError::MetadataPending { info_hash });
        }
        Ok(swarm)
    }
}

async fn bind_listener(shared: &Arc<Shared>, config: &NetworkConfig) -> Result<(), EngineError> {
    let listener = TcpListener::bind((config.listen_interface, config.listen_port)).await?;
    let addr = listener.local_addr()?;
    let cancel = shared.shutdown.child_token();
    tokio::spawn(accept_loop(Arc::clone(shared), listener, cancel.clone()));
    let previous = shared.listener.lock().replace(Listener { addr, cancel });
    if let Some(previous) = previous {
        previous.cancel.cancel();
    }
    tracing::info!(%addr, "Listening for peers");
    Ok(())
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_inbound(Arc::clone(&shared), stream, addr));
                }
                Err(e) => tracing::debug!("Accept failed: {e}"),
            },
        }
    }
}

async fn handle_inbound(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let timeout = shared.config.lock().peer_connect_timeout();
    let remote = match tokio::time::timeout(timeout, read_handshake(&mut stream)).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            tracing::trace!(peer = %addr, "Inbound handshake failed: {e}");
            return;
        }
        Err(_) => return,
    };
    let Some(swarm) = shared.swarms.lock().get(&remote.info_hash).cloned() else {
        tracing::trace!(peer = %addr, info_hash = %remote.info_hash, "Inbound peer for unknown torrent");
        return;
    };
    let limit = shared.config.lock().max_peers_per_torrent;
    if !swarm.try_connect(addr, limit) {
        return;
    }
    let ours = Handshake::new(swarm.info_hash, shared.peer_id);
    let result = match stream.write_all(&ours.encode()).await {
        Ok(()) => run_peer(Arc::clone(&swarm), shared.limits.clone(), stream, addr, remote).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        tracing::debug!(peer = %addr, "Inbound peer dropped: {e}");
    }
    swarm.disconnected(addr);
}

fn connect_peer(shared: &Arc<Shared>, swarm: &Arc<Swarm>, addr: SocketAddr) {
    let (limit, timeout) = {
        let config = shared.config.lock();
        (config.max_peers_per_torrent, config.peer_connect_timeout())
    };
    if swarm.recently_failed(addr) || !swarm.try_connect(addr, limit) {
        return;
    }
    let shared = Arc::clone(shared);
    let swarm = Arc::clone(swarm);
    tokio::spawn(async move {
        let result: Result<(), EngineError> = async {
            let timed_out = || std::io::Error::new(std::io::ErrorKind::TimedOut, "peer connect timed out");
            let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| timed_out())??;
            let ours = Handshake::new(swarm.info_hash, shared.peer_id);
            let remote = tokio::time::timeout(timeout, exchange_handshake(&mut stream, &ours))
                .await
                .map_err(|_| timed_out())??;
            tracing::debug!(peer = %addr, info_hash = %swarm.info_hash, "Peer connected");
            run_peer(Arc::clone(&swarm), shared.limits.clone(), stream, addr, remote).await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(peer = %addr, "Peer connection ended: {e}");
            swarm.mark_failed(addr);
        }
        swarm.disconnected(addr);
    });
}

/// Announces to every tracker of `swarm`, dials the returned peers and
/// returns the delay before the next announce.
async fn announce_all(shared: &Arc<Shared>, swarm: &Arc<Swarm>, event: AnnounceEvent) -> Duration {
    let port = shared
        .listener
        .lock()
        .as_ref()
        .map_or(0, |listener| listener.addr.port());
    let request = Announce {
        info_hash: swarm.info_hash,
        peer_id: shared.peer_id,
        port,
        uploaded: swarm.uploaded.total(),
        downloaded: swarm.downloaded.total(),
        left: swarm.left(),
        event,
        numwant: NUMWANT,
    };
    let timeout = shared.config.lock().tracker_timeout();
    let announces = swarm.trackers.iter().map(|url| {
        let client = &shared.client;
        async move { (url, tracker::announce(client, url, &request, timeout).await) }
    });
    let results = futures::future::join_all(announces).await;

    let mut interval: Option<Duration> = None;
    for (url, result) in results {
        match result {
            Ok(response) => {
                tracing::debug!(info_hash = %swarm.info_hash, %url, peers = response.peers.len(), "Announce succeeded");
                interval = Some(interval.map_or(response.interval, |i| i.min(response.interval)));
                if event != AnnounceEvent::Stopped {
                    for addr in response.peers {
                        connect_peer(shared, swarm, addr);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(info_hash = %swarm.info_hash, %url, "Announce failed: {e}");
                swarm.emit(EngineEvent::TrackerError {
                    info_hash: swarm.info_hash,
                    url: url.clone(),
                    message: e.to_string(),
                });
            }
        }
    }
    match interval {
        Some(interval) => interval.min(MAX_INTERVAL),
        None if swarm.trackers.is_empty() => MAX_INTERVAL,
        None => RETRY_INTERVAL,
    }
}

async fn drive_swarm(shared: Arc<Shared>, swarm: Arc<Swarm>) {
    let mut event = AnnounceEvent::Started;
    loop {
        let wait = tokio::select! {
            _ = swarm.cancel.cancelled() => break,
            wait = announce_all(&shared, &swarm, event) => wait,
        };
        event = AnnounceEvent::None;
        tokio::select! {
            _ = swarm.cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    if !swarm.trackers.is_empty() && !shared.shutdown.is_cancelled() {
        announce_all(&shared, &swarm, AnnounceEvent::Stopped).await;
    }
}

#[async_trait]
impl SwarmEngine for WireEngine {
    async fn add_torrent(&self, source: TorrentSource) -> Result<(), EngineError> {
        self.shared.lifecycle.ensure_running()?;
        let info_hash = source.info_hash();
        let swarm = {
            let mut swarms = self.shared.swarms.lock();
            if swarms.contains_key(&info_hash) {
                return Ok(());
            }
            let swarm = Swarm::new(
                info_hash,
                source.trackers().to_vec(),
                None,
                self.shared.events.clone(),
                self.shared.shutdown.child_token(),
            );
            swarms.insert(info_hash, Arc::clone(&swarm));
            swarm
        };
        if let Some(metainfo) = source.metainfo() {
            swarm.publish_metainfo(Arc::clone(metainfo));
        }
        tracing::info!(info_hash = %info_hash, trackers = swarm.trackers.len(), "Torrent added to swarm");
        tokio::spawn(drive_swarm(Arc::clone(&self.shared), swarm));
        Ok(())
    }

    async fn attach_storage(&self, info_hash: InfoHash, store: Arc<PieceStore>) -> Result<(), EngineError> {
        let swarm = self.swarm_with_metadata(info_hash)?;
        swarm.check_finished(&store);
        swarm.store.send_replace(Some(store));
        Ok(())
    }

    async fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        if let Some(swarm) = self.shared.swarms.lock().remove(&info_hash) {
            swarm.cancel.cancel();
            tracing::info!(info_hash = %info_hash, "Torrent removed from swarm");
        }
        Ok(())
    }

    async fn set_piece_priority(&self, info_hash: InfoHash, piece: u32, priority: Priority) -> Result<(), EngineError> {
        let swarm = self.swarm_with_metadata(info_hash)?;
        swarm.priorities.send_modify(|map| map.set(piece, priority));
        Ok(())
    }

    async fn set_piece_deadline(&self, info_hash: InfoHash, piece: u32, deadline: Duration) -> Result<(), EngineError> {
        let swarm = self.swarm_with_metadata(info_hash)?;
        swarm.priorities.send_modify(|map| map.set_deadline(piece, deadline));
        Ok(())
    }

    async fn apply_priorities(&self, info_hash: InfoHash, map: PriorityMap) -> Result<(), EngineError> {
        let swarm = self.swarm_with_metadata(info_hash)?;
        swarm.priorities.send_replace(map);
        Ok(())
    }

    async fn piece_state(&self, info_hash: InfoHash, piece: u32) -> Result<PieceState, EngineError> {
        let swarm = self.swarm(info_hash)?;
        Ok(swarm
            .current_store()
            .map_or(PieceState::Absent, |store| store.state(piece)))
    }

    async fn stats(&self, info_hash: InfoHash) -> Result<SwarmStats, EngineError> {
        let swarm = self.swarm(info_hash)?;
        Ok(SwarmStats {
            download_rate: swarm.downloaded.rate(),
            upload_rate: swarm.uploaded.rate(),
            peers: swarm.peer_count(),
            downloaded: swarm.downloaded.total(),
            uploaded: swarm.uploaded.total(),
        })
    }

    async fn reconfigure(&self, config: &NetworkConfig) -> Result<(), EngineError> {
        self.shared.lifecycle.ensure_running()?;
        self.shared.lifecycle.set(SessionState::Reconfiguring);
        let previous = std::mem::replace(&mut *self.shared.config.lock(), config.clone());
        self.shared.limits.download.set_rate(config.download_limit);
        self.shared.limits.upload.set_rate(config.upload_limit);

        let rebind = previous.listen_port != config.listen_port
            || previous.listen_interface != config.listen_interface;
        let result = if rebind {
            bind_listener(&self.shared, config).await
        } else {
            Ok(())
        };
        self.shared.lifecycle.set(SessionState::Running);
        tracing::info!(
            download_limit = ?config.download_limit,
            upload_limit = ?config.upload_limit,
            rebind,
            "Wire engine reconfigured"
        );
        result
    }

    fn state(&self) -> SessionState {
        self.shared.lifecycle.get()
    }

    fn name(&self) -> &'static str {
        "wire"
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.shared.lifecycle.set(SessionState::Stopping);
        self.shared.shutdown.cancel();
        self.shared.swarms.lock().clear();
        self.shared.listener.lock().take();
        self.shared.lifecycle.set(SessionState::Stopped);
        tracing::info!("Wire engine stopped");
        Ok(())
    }
}
