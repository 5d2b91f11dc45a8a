//! One peer connection: message loop, block requests, uploads and metadata
//! exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::{broadcast, mpsc};

use super::metadata::{ExtensionHandshake, LOCAL_UT_METADATA, MetadataMessage, metadata_piece};
use super::protocol::{
    EXTENDED_HANDSHAKE, Handshake, PeerMessage, bitfield_has, encode_bitfield, read_message,
    write_message,
};
use super::swarm::Swarm;
use super::token_bucket::RateLimiter;
use crate::session::{EngineError, EngineEvent};
use crate::storage::{BlockWrite, PieceStore, StoreError};

/// Outstanding block requests per peer.
const PIPELINE: usize = 16;
/// Larger upload requests are ignored.
const MAX_UPLOAD_BLOCK: u32 = 128 * 1024;
const KEEPALIVE: Duration = Duration::from_secs(90);
const TICK: Duration = Duration::from_millis(500);

/// Engine-wide bandwidth limiters shared by every connection.
#[derive(Debug, Clone)]
pub struct PeerLimits {
    pub download: Arc<RateLimiter>,
    pub upload: Arc<RateLimiter>,
}

/// Runs a connection whose handshake has already been exchanged until the
/// peer disconnects or the swarm is cancelled.
///
/// # Errors
///
/// - `EngineError::Protocol` - Peer sent a malformed message
/// - `EngineError::Io` - Connection failed while writing
pub async fn run_peer<S>(
    swarm: Arc<Swarm>,
    limits: PeerLimits,
    stream: S,
    addr: SocketAddr,
    remote: Handshake,
) -> Result<(), EngineError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(64);
    let reader_task = tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::trace!(peer = %addr, "Peer stream ended: {e}");
                    break;
                }
            }
        }
    });

    let mut session = PeerSession {
        swarm,
        limits,
        writer,
        addr,
        extensions: remote.supports_extensions(),
        remote_metadata: None,
        pending_metadata: None,
        metadata_refused: false,
        peer_choking: true,
        am_choking: true,
        peer_have: Vec::new(),
        last_sent: Instant::now(),
    };
    let result = session.drive(rx).await;
    reader_task.abort();
    result
}

struct PeerSession<S> {
    swarm: Arc<Swarm>,
    limits: PeerLimits,
    writer: WriteHalf<S>,
    addr: SocketAddr,
    extensions: bool,
    /// Remote's id for ut_metadata
    remote_metadata: Option<u8>,
    pending_metadata: Option<u32>,
    metadata_refused: bool,
    peer_choking: bool,
    am_choking: bool,
    peer_have: Vec<u8>,
    last_sent: Instant,
}

impl<S: AsyncRead + AsyncWrite> PeerSession<S> {
    async fn drive(&mut self, mut rx: mpsc::Receiver<PeerMessage>) -> Result<(), EngineError> {
        let mut haves = self.swarm.haves.subscribe();
        let mut stores = self.swarm.store.subscribe();
        self.open().await?;

        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = self.swarm.cancel.cancelled() => return Ok(()),
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await?,
                    None => return Ok(()),
                },
                have = haves.recv() => match have {
                    Ok(piece) => self.send(PeerMessage::Have { piece }).await?,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                changed = stores.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    self.announce_store().await?;
                }
                _ = tick.tick() => {
                    if self.last_sent.elapsed() >= KEEPALIVE {
                        self.send(PeerMessage::KeepAlive).await?;
                    }
                }
            }
            self.fill_requests().await?;
        }
    }

    async fn send(&mut self, message: PeerMessage) -> Result<(), EngineError> {
        write_message(&mut self.writer, &message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn open(&mut self) -> Result<(), EngineError> {
        if let Some(store) = self.swarm.current_store() {
            let have = store.have_bitfield();
            if have.iter().any(|has| *has) {
                let bitfield = encode_bitfield(&have);
                self.send(PeerMessage::Bitfield { bitfield }).await?;
            }
        }
        if self.extensions {
            let size = self.swarm.metainfo().map(|m| m.info_bytes.len());
            let payload = ExtensionHandshake::encode(size);
            self.send(PeerMessage::Extended {
                id: EXTENDED_HANDSHAKE,
                payload,
            })
            .await?;
        }
        self.send(PeerMessage::Interested).await
    }

    /// Advertises pieces of a store attached after the connection opened.
    async fn announce_store(&mut self) -> Result<(), EngineError> {
        let Some(store) = self.swarm.current_store() else {
            return Ok(());
        };
        let verified: Vec<u32> = (0..store.piece_count())
            .filter(|piece| store.is_verified(*piece))
            .collect();
        for piece in verified {
            self.send(PeerMessage::Have { piece }).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, message: PeerMessage) -> Result<(), EngineError> {
        match message {
            PeerMessage::KeepAlive | PeerMessage::Port { .. } | PeerMessage::Cancel { .. } => {}
            PeerMessage::Choke => {
                self.peer_choking = true;
                self.swarm.picker.lock().release_peer(self.addr);
            }
            PeerMessage::Unchoke => self.peer_choking = false,
            PeerMessage::Interested => {
                if self.am_choking {
                    self.am_choking = false;
                    self.send(PeerMessage::Unchoke).await?;
                }
            }
            PeerMessage::NotInterested => {}
            PeerMessage::Have { piece } => set_bit(&mut self.peer_have, piece),
            PeerMessage::Bitfield { bitfield } => self.peer_have = bitfield.to_vec(),
            PeerMessage::Request {
                piece,
                offset,
                length,
            } => self.serve_block(piece, offset, length).await?,
            PeerMessage::Piece {
                piece,
                offset,
                data,
            } => self.receive_block(piece, offset, data).await,
            PeerMessage::Extended { id, payload } => self.handle_extended(id, payload).await?,
        }
        Ok(())
    }

    async fn serve_block(&mut self, piece: u32, offset: u32, length: u32) -> Result<(), EngineError> {
        if self.am_choking || length == 0 || length > MAX_UPLOAD_BLOCK {
            return Ok(());
        }
        let Some(store) = self.swarm.current_store() else {
            return Ok(());
        };
        if !store.is_verified(piece) {
            return Ok(());
        }
        self.limits.upload.acquire(u64::from(length)).await;
        match store.fetch_block(piece, offset, length).await {
            Ok(data) => {
                self.swarm.uploaded.record(data.len() as u64);
                self.send(PeerMessage::Piece {
                    piece,
                    offset,
                    data,
                })
                .await
            }
            Err(e) => {
                tracing::trace!(peer = %self.addr, piece, "Cannot serve block: {e}");
                Ok(())
            }
        }
    }

    async fn receive_block(&mut self, piece: u32, offset: u32, data: Bytes) {
        self.swarm.picker.lock().complete(piece, offset);
        let Some(store) = self.swarm.current_store() else {
            return;
        };
        self.swarm.downloaded.record(data.len() as u64);
        match store.put_block(piece, offset, data).await {
            Ok(BlockWrite::PieceFull) => self.verify(&store, piece).await,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(peer = %self.addr, piece, offset, "Block rejected: {e}");
                self.swarm.picker.lock().reset_piece(piece);
                if matches!(e, StoreError::StorageFull { .. }) {
                    self.swarm.emit(EngineEvent::StorageFailed {
                        info_hash: self.swarm.info_hash,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    async fn verify(&self, store: &Arc<PieceStore>, piece: u32) {
        let info_hash = self.swarm.info_hash;
        match store.verify_piece(piece).await {
            Ok(true) => {
                self.swarm.emit(EngineEvent::PieceCompleted { info_hash, piece });
                let _ = self.swarm.haves.send(piece);
                self.swarm.check_finished(store);
            }
            Ok(false) => {
                self.swarm.picker.lock().reset_piece(piece);
                self.swarm.emit(EngineEvent::PieceHashFailed { info_hash, piece });
            }
            Err(e) => tracing::debug!(info_hash = %info_hash, piece, "Verification skipped: {e}"),
        }
    }

    async fn handle_extended(&mut self, id: u8, payload: Bytes) -> Result<(), EngineError> {
        if id == EXTENDED_HANDSHAKE {
            let handshake = ExtensionHandshake::decode(&payload)?;
            self.remote_metadata = handshake.ut_metadata;
            if let (Some(_), Some(size)) = (handshake.ut_metadata, handshake.metadata_size) {
                self.swarm.begin_metadata(size);
            }
            return Ok(());
        }
        if id != LOCAL_UT_METADATA {
            return Ok(());
        }

        match MetadataMessage::decode(&payload)? {
            MetadataMessage::Request { piece } => {
                let Some(remote_id) = self.remote_metadata else {
                    return Ok(());
                };
                let reply = self
                    .swarm
                    .metainfo()
                    .and_then(|m| {
                        metadata_piece(&m.info_bytes, piece).map(|data| MetadataMessage::Data {
                            piece,
                            total_size: m.info_bytes.len(),
                            data,
                        })
                    })
                    .unwrap_or(MetadataMessage::Reject { piece });
                self.send(PeerMessage::Extended {
                    id: remote_id,
                    payload: reply.encode(),
                })
                .await?;
            }
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => {
                if self.pending_metadata == Some(piece) {
                    self.pending_metadata = None;
                }
                self.swarm.accept_metadata(piece, total_size, data);
            }
            MetadataMessage::Reject { piece } => {
                if self.pending_metadata == Some(piece) {
                    self.pending_metadata = None;
                    self.swarm.release_metadata_request(piece);
                }
                self.metadata_refused = true;
            }
        }
        Ok(())
    }

    async fn fill_requests(&mut self) -> Result<(), EngineError> {
        if self.swarm.metainfo().is_none() {
            return self.request_metadata().await;
        }
        if self.peer_choking {
            return Ok(());
        }
        let Some(store) = self.swarm.current_store() else {
            return Ok(());
        };

        let order = self.swarm.priorities.borrow().request_order();
        let requests = {
            let mut picker = self.swarm.picker.lock();
            let outstanding = picker.outstanding(self.addr);
            if outstanding >= PIPELINE {
                return Ok(());
            }
            let peer_have = &self.peer_have;
            picker.pick(
                self.addr,
                &order,
                |piece| bitfield_has(peer_have, piece),
                &store,
                PIPELINE - outstanding,
            )
        };
        for request in requests {
            self.limits.download.acquire(u64::from(request.length)).await;
            self.send(PeerMessage::Request {
                piece: request.piece,
                offset: request.offset,
                length: request.length,
            })
            .await?;
        }
        Ok(())
    }

    async fn request_metadata(&mut self) -> Result<(), EngineError> {
        if self.pending_metadata.is_some() || self.metadata_refused {
            return Ok(());
        }
        let Some(remote_id) = self.remote_metadata else {
            return Ok(());
        };
        if let Some(piece) = self.swarm.next_metadata_request() {
            self.pending_metadata = Some(piece);
            self.send(PeerMessage::Extended {
                id: remote_id,
                payload: MetadataMessage::Request { piece }.encode(),
            })
            .await?;
        }
        Ok(())
    }
}

fn set_bit(bitfield: &mut Vec<u8>, piece: u32) {
    let byte = (piece / 8) as usize;
    if bitfield.len() <= byte {
        bitfield.resize(byte + 1, 0);
    }
    bitfield[byte] |= 0x80 >> (piece % 8);
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::session::wire::protocol::PeerId;
    use crate::session::{EventReceiver, PriorityMap, event_channel};
    use crate::storage::StoragePolicy;
    use crate::torrent::metainfo::fixtures::metainfo;
    use crate::torrent::synthetic::fill_payload;
    use crate::torrent::{PieceRange, Priority};

    fn limits() -> PeerLimits {
        PeerLimits {
            download: Arc::new(RateLimiter::new(None)),
            upload: Arc::new(RateLimiter::new(None)),
        }
    }

    async fn next_event(rx: &mut EventReceiver) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_set_bit_grows_bitfield() {
        let mut bitfield = Vec::new();
        set_bit(&mut bitfield, 9);
        assert_eq!(bitfield, vec![0x00, 0x40]);
        assert!(bitfield_has(&bitfield, 9));
    }

    #[tokio::test]
    async fn test_leecher_fetches_metadata_and_pieces_from_seeder() {
        let meta = Arc::new(metainfo("clip.mkv", 32768, &[("clip.mkv", 3 * 32768 + 1000)], 9));
        let info_hash = meta.info_hash;
        let cancel = CancellationToken::new();

        let seeder_store = PieceStore::open(&meta, StoragePolicy::Memory { budget: 1 << 20 }).unwrap();
        for piece in 0..meta.piece_count() {
            let mut buf = vec![0u8; meta.piece_size(piece) as usize];
            fill_payload(9, u64::from(piece) * 32768, &mut buf);
            seeder_store.write_block(piece, 0, &buf).unwrap();
            assert!(seeder_store.on_piece_complete(piece).unwrap());
        }
        let (seeder_tx, _seeder_rx) = event_channel();
        let seeder = Swarm::new(info_hash, Vec::new(), Some(Arc::clone(&meta)), seeder_tx, cancel.child_token());
        seeder.store.send_replace(Some(seeder_store));

        let (leecher_tx, mut leecher_rx) = event_channel();
        let leecher = Swarm::new(info_hash, Vec::new(), None, leecher_tx, cancel.child_token());

        let (a, b) = tokio::io::duplex(1 << 16);
        let seeder_addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let leecher_addr = SocketAddr::from(([127, 0, 0, 1], 2));
        tokio::spawn(run_peer(
            Arc::clone(&seeder),
            limits(),
            a,
            leecher_addr,
            Handshake::new(info_hash, PeerId::generate()),
        ));
        tokio::spawn(run_peer(
            Arc::clone(&leecher),
            limits(),
            b,
            seeder_addr,
            Handshake::new(info_hash, PeerId::generate()),
        ));

        let fetched = match next_event(&mut leecher_rx).await {
            EngineEvent::MetadataReceived { metainfo, .. } => metainfo,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(fetched.info_bytes, meta.info_bytes);

        let store = PieceStore::open(&fetched, StoragePolicy::Memory { budget: 1 << 20 }).unwrap();
        let mut map = PriorityMap::skipped(fetched.piece_count());
        map.set_range(PieceRange::new(0, fetched.piece_count()), Priority::Normal);
        leecher.priorities.send_replace(map);
        leecher.store.send_replace(Some(Arc::clone(&store)));

        loop {
            if let EngineEvent::TorrentFinished { .. } = next_event(&mut leecher_rx).await {
                break;
            }
        }
        assert_eq!(store.verified_count(), 4);
        assert!(leecher.downloaded.total() >= meta.total_length);
        assert!(seeder.uploaded.total() >= meta.total_length);
        cancel.cancel();
    }
}
