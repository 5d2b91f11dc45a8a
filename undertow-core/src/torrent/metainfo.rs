//! Parsed .torrent payload and the raw info dictionary it was hashed from.

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::bencode::{self, BencodeDict, Encoder};
use super::layout::FileEntry;
use super::{InfoHash, MetainfoError};

/// Parsed metainfo of a torrent.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub trackers: Vec<String>,
    /// Info dictionary exactly as hashed; served and persisted verbatim
    pub info_bytes: Bytes,
}

/// Largest accepted piece; one memory slot holds one piece.
pub const MAX_PIECE_LENGTH: u32 = 64 * 1024 * 1024;

fn invalid(reason: impl Into<String>) -> MetainfoError {
    MetainfoError::InvalidTorrentFile {
        reason: reason.into(),
    }
}

impl Metainfo {
    /// Parses a complete .torrent file.
    ///
    /// # Errors
    ///
    /// - `MetainfoError::InvalidTorrentFile` - Malformed bencode or missing required fields
    pub fn from_torrent_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let span = bencode::top_level_value_span(data, b"info")?
            .ok_or_else(|| invalid("Missing 'info' field"))?;
        let root = bencode::parse_root_dict(data)?;
        let trackers = extract_trackers(&root);
        Self::from_info_bytes(&data[span], trackers)
    }

    /// Parses a bare info dictionary, as received over the metadata extension.
    ///
    /// # Errors
    ///
    /// - `MetainfoError::InvalidTorrentFile` - Malformed dictionary or missing required fields
    pub fn from_info_bytes(info: &[u8], trackers: Vec<String>) -> Result<Self, MetainfoError> {
        let end = bencode::value_end(info, 0)?;
        let info = &info[..end];
        let dict = bencode::parse_root_dict(info)?;

        let name = bencode::get_str(&dict, b"name").ok_or_else(|| invalid("Missing 'name'"))?;
        check_component(&name)?;
        let piece_length = bencode::get_int(&dict, b"piece length")
            .filter(|length| *length > 0 && *length <= i64::from(MAX_PIECE_LENGTH))
            .ok_or_else(|| invalid("Missing or invalid 'piece length'"))?
            as u32;

        let pieces = bencode::get_bytes(&dict, b"pieces").ok_or_else(|| invalid("Missing 'pieces'"))?;
        if pieces.len() % 20 != 0 {
            return Err(invalid("Invalid pieces length"));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let raw_files = match bencode::get_int(&dict, b"length") {
            Some(length) if length >= 0 => vec![(vec![name.clone()], length as u64)],
            Some(_) => return Err(invalid("Negative length")),
            None => extract_files(&dict, &name)?,
        };
        let files = FileEntry::layout(raw_files);
        let total_length: u64 = files.iter().map(|file| file.length).sum();

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(format!(
                "Piece count mismatch: {} hashes for {} bytes",
                piece_hashes.len(),
                total_length
            )));
        }

        let digest = Sha1::digest(info);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);

        Ok(Self {
            info_hash: InfoHash::new(hash),
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            trackers,
            info_bytes: Bytes::copy_from_slice(info),
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of `piece`; only the final piece may be shorter.
    pub fn piece_size(&self, piece: u32) -> u32 {
        piece_size(self.piece_length, self.total_length, piece)
    }

    /// Re-encodes a .torrent holding the original info dictionary.
    pub fn to_torrent_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.begin_dict();
        if let Some(primary) = self.trackers.first() {
            encoder.bytes(b"announce").bytes(primary.as_bytes());
            encoder.bytes(b"announce-list").begin_list();
            for tracker in &self.trackers {
                encoder.begin_list().bytes(tracker.as_bytes()).end();
            }
            encoder.end();
        }
        encoder.bytes(b"info").raw(&self.info_bytes).end();
        encoder.finish()
    }
}

/// Length of `piece` in a torrent with the given geometry.
pub fn piece_size(piece_length: u32, total_length: u64, piece: u32) -> u32 {
    let start = u64::from(piece) * u64::from(piece_length);
    total_length.saturating_sub(start).min(u64::from(piece_length)) as u32
}

fn extract_files(dict: &BencodeDict<'_>, name: &str) -> Result<Vec<(Vec<String>, u64)>, MetainfoError> {
    let Some(bencode_rs::Value::List(entries)) = dict.get(b"files".as_slice()) else {
        return Err(invalid("Missing 'files' or 'length' field"));
    };

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let bencode_rs::Value::Dictionary(file) = entry else {
            return Err(invalid("Invalid file entry type"));
        };
        let length = bencode::get_int(file, b"length")
            .filter(|length| *length >= 0)
            .ok_or_else(|| invalid("Missing or invalid file length"))?;
        let Some(bencode_rs::Value::List(components)) = file.get(b"path".as_slice()) else {
            return Err(invalid("Missing or invalid path in file"));
        };

        let mut path = vec![name.to_string()];
        for component in components {
            let bencode_rs::Value::Bytes(bytes) = component else {
                return Err(invalid("Invalid path component type"));
            };
            let component = String::from_utf8_lossy(bytes);
            check_component(&component)?;
            path.push(component.into_owned());
        }
        files.push((path, length as u64));
    }
    Ok(files)
}

/// A name or path component must stay a single entry inside the payload root.
fn check_component(component: &str) -> Result<(), MetainfoError> {
    let unsafe_component = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\', '\0'])
        || (component.len() >= 2 && component.as_bytes()[1] == b':');
    if unsafe_component {
        return Err(invalid(format!("Unsafe path component: {component:?}")));
    }
    Ok(())
}

fn extract_trackers(root: &BencodeDict<'_>) -> Vec<String> {
    let mut trackers = Vec::new();
    if let Some(announce) = bencode::get_str(root, b"announce") {
        trackers.push(announce);
    }
    if let Some(bencode_rs::Value::List(tiers)) = root.get(b"announce-list".as_slice()) {
        for tier in tiers {
            if let bencode_rs::Value::List(urls) = tier {
                for url in urls {
                    if let bencode_rs::Value::Bytes(bytes) = url {
                        let url = String::from_utf8_lossy(bytes).into_owned();
                        if !trackers.contains(&url) {
                            trackers.push(url);
                        }
                    }
                }
            }
        }
    }
    trackers
}

/// Synthetic torrents for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures {
    pub use crate::torrent::synthetic::{info_dict, payload_byte};

    use super::Metainfo;

    /// Parsed metainfo for a synthetic torrent.
    pub fn metainfo(name: &str, piece_length: u32, files: &[(&str, u64)], seed: u8) -> Metainfo {
        let info = info_dict(name, piece_length, files, seed);
        match Metainfo::from_info_bytes(&info, vec!["http://tracker.invalid/announce".to_string()]) {
            Ok(metainfo) => metainfo,
            Err(e) => panic!("fixture metainfo must parse: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_single_file_metainfo() {
        let meta = metainfo("movie.mkv", 16384, &[("movie.mkv", 40000)], 1);
        assert_eq!(meta.name, "movie.mkv");
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.piece_size(0), 16384);
        assert_eq!(meta.piece_size(2), 40000 - 2 * 16384);
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].path, vec!["movie.mkv".to_string()]);
    }

    #[test]
    fn test_multi_file_paths_are_rooted_at_name() {
        let meta = metainfo(
            "Pack",
            16384,
            &[("Sample/sample.mkv", 1000), ("movie.mp4", 50000)],
            2,
        );
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].display_path(), "Pack/Sample/sample.mkv");
        assert_eq!(meta.files[1].offset, 1000);
        assert_eq!(meta.total_length, 51000);
    }

    #[test]
    fn test_torrent_roundtrip_preserves_info_hash() {
        let meta = metainfo("movie.mkv", 16384, &[("movie.mkv", 40000)], 3);
        let encoded = meta.to_torrent_bytes();
        let reparsed = Metainfo::from_torrent_bytes(&encoded).unwrap();
        assert_eq!(reparsed.info_hash, meta.info_hash);
        assert_eq!(reparsed.trackers, meta.trackers);
        assert_eq!(reparsed.info_bytes, meta.info_bytes);
    }

    #[test]
    fn test_info_bytes_trailing_data_is_ignored() {
        let mut info = info_dict("a.mkv", 16384, &[("a.mkv", 100)], 4);
        let expected = Metainfo::from_info_bytes(&info, Vec::new()).unwrap().info_hash;
        info.extend_from_slice(b"trailing");
        let parsed = Metainfo::from_info_bytes(&info, Vec::new()).unwrap();
        assert_eq!(parsed.info_hash, expected);
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        let info = b"d6:lengthi100000e4:name1:a12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let err = Metainfo::from_info_bytes(info, Vec::new()).unwrap_err();
        assert!(matches!(err, MetainfoError::InvalidTorrentFile { .. }));
    }

    #[test]
    fn test_rejects_names_leaving_payload_root() {
        for name in ["../escaped.bin", "/tmp/x", "..", ".", "", "a/b", "a\\b", "C:evil"] {
            let info = info_dict(name, 16384, &[(name, 100)], 5);
            assert!(
                matches!(
                    Metainfo::from_info_bytes(&info, Vec::new()),
                    Err(MetainfoError::InvalidTorrentFile { .. })
                ),
                "{name:?} accepted"
            );
        }
        let info = info_dict("Pack", 16384, &[("ok.mkv", 100), ("../../x.mkv", 100)], 5);
        assert!(Metainfo::from_info_bytes(&info, Vec::new()).is_err());
    }

    #[test]
    fn test_rejects_oversized_piece_length() {
        let info = b"d6:lengthi100e4:name1:a12:piece lengthi134217728e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        assert!(Metainfo::from_info_bytes(info, Vec::new()).is_err());
        let info = b"d6:lengthi100e4:name1:a12:piece lengthi67108864e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        assert!(Metainfo::from_info_bytes(info, Vec::new()).is_ok());
    }

    #[test]
    fn test_rejects_missing_info() {
        assert!(Metainfo::from_torrent_bytes(b"d8:announce3:urle").is_err());
        assert!(Metainfo::from_torrent_bytes(b"not bencode").is_err());
    }
}
