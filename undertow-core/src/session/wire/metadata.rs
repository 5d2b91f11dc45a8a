//! Metadata exchange over the extension protocol (BEP 9 / BEP 10).

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::session::EngineError;
use crate::torrent::InfoHash;
use crate::torrent::bencode::{self, Encoder};

/// Size of one ut_metadata piece.
pub const METADATA_PIECE: usize = 16 * 1024;
/// Refuse metadata larger than this.
const MAX_METADATA: usize = 16 * 1024 * 1024;
/// Id we assign to ut_metadata in our extension handshake.
pub const LOCAL_UT_METADATA: u8 = 1;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

fn protocol_error(message: impl Into<String>) -> EngineError {
    EngineError::Protocol {
        message: message.into(),
    }
}

/// Remote capabilities from its extension handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtensionHandshake {
    /// Remote's message id for ut_metadata
    pub ut_metadata: Option<u8>,
    pub metadata_size: Option<usize>,
}

impl ExtensionHandshake {
    /// Our handshake payload; `metadata_size` is advertised once known.
    pub fn encode(metadata_size: Option<usize>) -> Bytes {
        let mut encoder = Encoder::new();
        encoder.begin_dict();
        encoder
            .bytes(b"m")
            .begin_dict()
            .bytes(b"ut_metadata")
            .int(i64::from(LOCAL_UT_METADATA))
            .end();
        if let Some(size) = metadata_size {
            encoder.bytes(b"metadata_size").int(size as i64);
        }
        encoder.bytes(b"v").bytes(b"Undertow 0.1").end();
        Bytes::from(encoder.finish())
    }

    /// # Errors
    ///
    /// - `EngineError::Protocol` - Payload is not a bencoded dictionary
    pub fn decode(payload: &[u8]) -> Result<Self, EngineError> {
        let dict = bencode::parse_root_dict(payload).map_err(|e| protocol_error(e.to_string()))?;
        let ut_metadata = match dict.get(b"m".as_slice()) {
            Some(bencode_rs::Value::Dictionary(m)) => bencode::get_int(m, b"ut_metadata")
                .and_then(|id| u8::try_from(id).ok())
                .filter(|id| *id != 0),
            _ => None,
        };
        let metadata_size = bencode::get_int(&dict, b"metadata_size")
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size > 0 && *size <= MAX_METADATA);
        Ok(Self {
            ut_metadata,
            metadata_size,
        })
    }
}

/// One ut_metadata message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: usize, data: Bytes },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Bytes {
        let mut encoder = Encoder::new();
        encoder.begin_dict();
        let trailer = match self {
            MetadataMessage::Request { piece } => {
                encoder
                    .bytes(b"msg_type")
                    .int(MSG_REQUEST)
                    .bytes(b"piece")
                    .int(i64::from(*piece));
                None
            }
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => {
                encoder
                    .bytes(b"msg_type")
                    .int(MSG_DATA)
                    .bytes(b"piece")
                    .int(i64::from(*piece))
                    .bytes(b"total_size")
                    .int(*total_size as i64);
                Some(data)
            }
            MetadataMessage::Reject { piece } => {
                encoder
                    .bytes(b"msg_type")
                    .int(MSG_REJECT)
                    .bytes(b"piece")
                    .int(i64::from(*piece));
                None
            }
        };
        encoder.end();
        let mut out = encoder.finish();
        if let Some(data) = trailer {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    /// # Errors
    ///
    /// - `EngineError::Protocol` - Malformed dictionary or unknown msg_type
    pub fn decode(payload: &Bytes) -> Result<Self, EngineError> {
        let end = bencode::value_end(payload, 0).map_err(|e| protocol_error(e.to_string()))?;
        let dict =
            bencode::parse_root_dict(&payload[..end]).map_err(|e| protocol_error(e.to_string()))?;
        let piece = bencode::get_int(&dict, b"piece")
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| protocol_error("ut_metadata message without piece"))?;
        match bencode::get_int(&dict, b"msg_type") {
            Some(MSG_REQUEST) => Ok(MetadataMessage::Request { piece }),
            Some(MSG_DATA) => {
                let total_size = bencode::get_int(&dict, b"total_size")
                    .and_then(|size| usize::try_from(size).ok())
                    .ok_or_else(|| protocol_error("ut_metadata data without total_size"))?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload.slice(end..),
                })
            }
            Some(MSG_REJECT) => Ok(MetadataMessage::Reject { piece }),
            other => Err(protocol_error(format!("Unknown ut_metadata msg_type {other:?}"))),
        }
    }
}

/// Collects metadata pieces from peers and verifies them against the
/// infohash.
#[derive(Debug)]
pub struct MetadataAssembler {
    size: usize,
    pieces: Vec<Option<Bytes>>,
    requested: Vec<bool>,
}

impl MetadataAssembler {
    /// # Errors
    ///
    /// - `EngineError::Protocol` - Size is zero or implausibly large
    pub fn new(size: usize) -> Result<Self, EngineError> {
        if size == 0 || size > MAX_METADATA {
            return Err(protocol_error(format!("Unacceptable metadata size {size}")));
        }
        let count = size.div_ceil(METADATA_PIECE);
        Ok(Self {
            size,
            pieces: vec![None; count],
            requested: vec![false; count],
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Next piece nobody has been asked for yet. When every piece has been
    /// requested, re-requests the first missing one.
    pub fn next_request(&mut self) -> Option<u32> {
        let index = self
            .pieces
            .iter()
            .zip(&self.requested)
            .position(|(piece, requested)| piece.is_none() && !requested)
            .or_else(|| self.pieces.iter().position(Option::is_none))?;
        self.requested[index] = true;
        Some(index as u32)
    }

    /// Releases a rejected request so another peer can be asked.
    pub fn release(&mut self, piece: u32) {
        if let Some(requested) = self.requested.get_mut(piece as usize) {
            *requested = false;
        }
    }

    /// Stores a received piece. Returns false when it does not fit.
    pub fn accept(&mut self, piece: u32, total_size: usize, data: Bytes) -> bool {
        let index = piece as usize;
        if total_size != self.size || index >= self.pieces.len() {
            return false;
        }
        let expected = if index + 1 == self.pieces.len() {
            self.size - index * METADATA_PIECE
        } else {
            METADATA_PIECE
        };
        if data.len() != expected {
            return false;
        }
        self.pieces[index] = Some(data);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    /// Joins the pieces and checks the digest. On mismatch every piece is
    /// discarded and `None` is returned.
    pub fn finish(&mut self, info_hash: InfoHash) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut info = Vec::with_capacity(self.size);
        for piece in self.pieces.iter().flatten() {
            info.extend_from_slice(piece);
        }
        if Sha1::digest(&info).as_slice() == info_hash.as_bytes() {
            return Some(Bytes::from(info));
        }
        tracing::warn!(info_hash = %info_hash, "Assembled metadata failed hash check");
        self.pieces.iter_mut().for_each(|piece| *piece = None);
        self.requested.iter_mut().for_each(|flag| *flag = false);
        None
    }
}

/// Splits verified info bytes into the piece a peer asked for.
pub fn metadata_piece(info: &Bytes, piece: u32) -> Option<Bytes> {
    let start = piece as usize * METADATA_PIECE;
    if start >= info.len() {
        return None;
    }
    let end = (start + METADATA_PIECE).min(info.len());
    Some(info.slice(start..end))
}
