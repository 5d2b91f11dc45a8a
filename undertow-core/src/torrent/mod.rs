//! Torrent identity, metainfo, file layout and the per-torrent state machine.

pub mod active;
pub mod bencode;
pub mod item;
pub mod layout;
pub mod metainfo;
pub mod reference;
pub mod selection;
pub mod state;
pub mod synthetic;

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use active::{SelectedFile, Torrent, TorrentError, TorrentSettings, TorrentSnapshot};
pub use item::{MediaContext, MediaType, TorrentItem, TorrentItemState};
pub use layout::FileEntry;
pub use metainfo::Metainfo;
pub use reference::{TorrentRef, TorrentSource, resolve};
pub use selection::{FileSelector, Selection, SelectionHint, VideoFileSelector};
pub use state::{InvalidTransition, TorrentState};

use crate::error::ErrorKind;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary. Displayed and serialized as
/// 40 lowercase hex characters; this string is also the torrent id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses 40 hex characters.
    ///
    /// # Errors
    ///
    /// - `MetainfoError::InvalidInfoHash` - Wrong length or non-hex input
    pub fn from_hex(input: &str) -> Result<Self, MetainfoError> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(input, &mut hash).map_err(|_| MetainfoError::InvalidInfoHash {
            value: input.to_string(),
        })?;
        Ok(Self(hash))
    }

    /// Parses the 32-character base32 form found in some magnet links.
    ///
    /// # Errors
    ///
    /// - `MetainfoError::InvalidInfoHash` - Wrong length or outside the base32 alphabet
    pub fn from_base32(input: &str) -> Result<Self, MetainfoError> {
        let invalid = || MetainfoError::InvalidInfoHash {
            value: input.to_string(),
        };
        if input.len() != 32 {
            return Err(invalid());
        }

        let mut hash = [0u8; 20];
        let mut buffer: u64 = 0;
        let mut bits = 0;
        let mut out = 0;
        for c in input.bytes() {
            let value = match c.to_ascii_uppercase() {
                c @ b'A'..=b'Z' => c - b'A',
                c @ b'2'..=b'7' => c - b'2' + 26,
                _ => return Err(invalid()),
            };
            buffer = (buffer << 5) | u64::from(value);
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                hash[out] = (buffer >> bits) as u8;
                out += 1;
            }
        }
        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = MetainfoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            40 => Self::from_hex(s),
            32 => Self::from_base32(s),
            _ => Err(MetainfoError::InvalidInfoHash {
                value: s.to_string(),
            }),
        }
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Half-open range of piece indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PieceRange {
    pub start: u32,
    pub end: u32,
}

impl PieceRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, piece: u32) -> bool {
        piece >= self.start && piece < self.end
    }

    pub fn iter(&self) -> Range<u32> {
        self.start..self.end
    }

    /// Grows the range by `margin` pieces on both sides, capped at `limit`.
    pub fn widen(&self, margin: u32, limit: u32) -> Self {
        if self.is_empty() {
            return *self;
        }
        Self::new(
            self.start.saturating_sub(margin),
            self.end.saturating_add(margin).min(limit),
        )
    }
}

impl fmt::Display for PieceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Download priority of a piece, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Skipped,
    Normal,
    High,
    Now,
}

/// Errors from parsing torrent references and metainfo.
#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid info hash: {value}")]
    InvalidInfoHash { value: String },

    #[error("Unrecognized torrent reference: {input}")]
    InvalidRef { input: String },

    #[error("Failed to fetch torrent from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("I/O error reading torrent file")]
    Io(#[from] std::io::Error),
}

impl MetainfoError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidRef
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_info_hash_hex_roundtrip_and_case() {
        let upper: InfoHash = "0123456789ABCDEF0123456789ABCDEF01234567".parse().unwrap();
        let lower: InfoHash = "0123456789abcdef0123456789abcdef01234567".parse().unwrap();
        assert_eq!(upper, lower);
        assert!("0123".parse::<InfoHash>().is_err());
        assert!(InfoHash::from_hex("zz23456789abcdef0123456789abcdef01234567").is_err());
    }

    #[test]
    fn test_info_hash_base32() {
        // All-zero hash encodes to 32 'A's.
        let zero = InfoHash::from_base32("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(zero, InfoHash::new([0u8; 20]));

        let ones = InfoHash::from_base32("77777777777777777777777777777777").unwrap();
        assert_eq!(ones, InfoHash::new([0xffu8; 20]));

        assert!(InfoHash::from_base32("1AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").is_err());
    }

    #[test]
    fn test_info_hash_serde_as_string() {
        let hash = InfoHash::new([0xab; 20]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        let back: InfoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_piece_range_operations() {
        let range = PieceRange::new(4, 8);
        assert_eq!(range.len(), 4);
        assert!(range.contains(4));
        assert!(!range.contains(8));
        assert_eq!(range.widen(2, 9), PieceRange::new(2, 9));
        assert!(PieceRange::new(5, 3).is_empty());
        assert_eq!(PieceRange::empty().widen(3, 10), PieceRange::empty());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Now > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Skipped);
    }
}
