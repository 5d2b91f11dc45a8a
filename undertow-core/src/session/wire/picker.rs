//! Block request assignment across connected peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::storage::PieceStore;

pub const BLOCK_SIZE: u32 = 16 * 1024;
/// A request unanswered for this long may be handed to another peer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// One block to request from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    peer: SocketAddr,
    since: Instant,
}

/// Tracks outstanding block requests so that peers do not duplicate work.
#[derive(Debug, Default)]
pub struct BlockPicker {
    in_flight: HashMap<(u32, u32), InFlight>,
}

impl BlockPicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chooses up to `max` blocks for `peer`, walking `order` (most urgent
    /// first) and skipping pieces the peer lacks or that are verified.
    pub fn pick<F>(&mut self, peer: SocketAddr, order: &[u32], peer_has: F, store: &PieceStore, max: usize) -> Vec<BlockRequest>
    where
        F: Fn(u32) -> bool,
    {
        let now = Instant::now();
        let mut picked = Vec::new();
        for &piece in order {
            if picked.len() >= max {
                break;
            }
            if !peer_has(piece) || store.is_verified(piece) {
                continue;
            }
            for gap in store.missing_blocks(piece, BLOCK_SIZE) {
                if picked.len() >= max {
                    break;
                }
                let key = (piece, gap.start);
                let available = match self.in_flight.get(&key) {
                    None => true,
                    Some(flight) => flight.peer != peer && now.duration_since(flight.since) > REQUEST_TIMEOUT,
                };
                if available {
                    self.in_flight.insert(key, InFlight { peer, since: now });
                    picked.push(BlockRequest {
                        piece,
                        offset: gap.start,
                        length: gap.end - gap.start,
                    });
                }
            }
        }
        picked
    }

    /// Marks a block as answered.
    pub fn complete(&mut self, piece: u32, offset: u32) {
        self.in_flight.remove(&(piece, offset));
    }

    /// Forgets every request of a piece, e.g. after a hash failure or eviction.
    pub fn reset_piece(&mut self, piece: u32) {
        self.in_flight.retain(|(p, _), _| *p != piece);
    }

    /// Drops all requests owned by `peer` (choked or disconnected).
    pub fn release_peer(&mut self, peer: SocketAddr) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, flight| flight.peer != peer);
        before - self.in_flight.len()
    }

    pub fn outstanding(&self, peer: SocketAddr) -> usize {
        self.in_flight
            .values()
            .filter(|flight| flight.peer == peer)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::StoragePolicy;
    use crate::torrent::metainfo::fixtures::metainfo;

    fn store() -> Arc<PieceStore> {
        let meta = metainfo("x.mkv", 32768, &[("x.mkv", 4 * 32768)], 1);
        PieceStore::open(&meta, StoragePolicy::Memory { budget: 1 << 20 }).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_follows_order_and_peer_availability() {
        let store = store();
        let mut picker = BlockPicker::new();
        let picked = picker.pick(addr(1), &[3, 1, 0], |piece| piece != 1, &store, 3);
        assert_eq!(
            picked,
            vec![
                BlockRequest { piece: 3, offset: 0, length: BLOCK_SIZE },
                BlockRequest { piece: 3, offset: BLOCK_SIZE, length: BLOCK_SIZE },
                BlockRequest { piece: 0, offset: 0, length: BLOCK_SIZE },
            ]
        );
        assert_eq!(picker.outstanding(addr(1)), 3);
    }

    #[test]
    fn test_in_flight_blocks_are_not_duplicated() {
        let store = store();
        let mut picker = BlockPicker::new();
        picker.pick(addr(1), &[0], |_| true, &store, 10);
        assert!(picker.pick(addr(2), &[0], |_| true, &store, 10).is_empty());

        assert_eq!(picker.release_peer(addr(1)), 2);
        assert_eq!(picker.pick(addr(2), &[0], |_| true, &store, 10).len(), 2);
    }

    #[test]
    fn test_written_blocks_are_skipped() {
        let store = store();
        store.write_block(2, 0, &vec![0; BLOCK_SIZE as usize]).unwrap();
        let mut picker = BlockPicker::new();
        let picked = picker.pick(addr(1), &[2], |_| true, &store, 10);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].offset, BLOCK_SIZE);
        picker.complete(2, BLOCK_SIZE);
        assert_eq!(picker.outstanding(addr(1)), 0);
    }
}
