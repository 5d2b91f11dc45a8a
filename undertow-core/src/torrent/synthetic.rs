//! Deterministic synthetic torrents.
//!
//! Payload bytes are a pure function of a seed and the torrent offset, so a
//! simulated swarm and a test can agree on content without sharing buffers.

use sha1::{Digest, Sha1};

use super::bencode::Encoder;

/// Deterministic payload byte at torrent offset `position`.
pub fn payload_byte(seed: u8, position: u64) -> u8 {
    (position.wrapping_mul(31).wrapping_add(position >> 11) as u8) ^ seed
}

/// Fills `out` with the payload starting at torrent offset `position`.
pub fn fill_payload(seed: u8, position: u64, out: &mut [u8]) {
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = payload_byte(seed, position + i as u64);
    }
}

/// Encodes an info dictionary for `files` with piece hashes over content
/// generated by [`payload_byte`].
///
/// A single entry yields a single-file torrent named `name`; more entries
/// yield a multi-file torrent rooted at `name` with `/`-separated paths.
pub fn info_dict(name: &str, piece_length: u32, files: &[(&str, u64)], seed: u8) -> Vec<u8> {
    let total: u64 = files.iter().map(|(_, length)| length).sum();
    let mut pieces = Vec::new();
    let mut piece = vec![0u8; piece_length as usize];
    let mut offset = 0u64;
    while offset < total {
        let size = (total - offset).min(u64::from(piece_length)) as usize;
        fill_payload(seed, offset, &mut piece[..size]);
        pieces.extend_from_slice(&Sha1::digest(&piece[..size]));
        offset += size as u64;
    }

    let mut encoder = Encoder::new();
    encoder.begin_dict();
    if files.len() > 1 {
        encoder.bytes(b"files").begin_list();
        for (path, length) in files {
            encoder.begin_dict().bytes(b"length").int(*length as i64);
            encoder.bytes(b"path").begin_list();
            for component in path.split('/') {
                encoder.bytes(component.as_bytes());
            }
            encoder.end().end();
        }
        encoder.end();
    } else {
        encoder.bytes(b"length").int(total as i64);
    }
    encoder
        .bytes(b"name")
        .bytes(name.as_bytes())
        .bytes(b"piece length")
        .int(i64::from(piece_length))
        .bytes(b"pieces")
        .bytes(&pieces)
        .end();
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_matches_bytewise() {
        let mut out = [0u8; 64];
        fill_payload(9, 1000, &mut out);
        for (i, byte) in out.iter().enumerate() {
            assert_eq!(*byte, payload_byte(9, 1000 + i as u64));
        }
    }

    #[test]
    fn test_seed_changes_content() {
        let a = info_dict("a", 16384, &[("a", 20000)], 1);
        let b = info_dict("a", 16384, &[("a", 20000)], 2);
        assert_ne!(a, b);
    }
}
