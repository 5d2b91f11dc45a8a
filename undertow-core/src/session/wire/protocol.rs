//! BitTorrent peer wire protocol (BEP 3) with the extension bit of BEP 10.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::EngineError;
use crate::torrent::InfoHash;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;
/// Largest frame accepted from a peer: a 16 KiB block plus header slack, or
/// a bitfield for very large torrents.
const MAX_FRAME: usize = 1 << 20;
/// Extended message id for the extension handshake.
pub const EXTENDED_HANDSHAKE: u8 = 0;

/// 20-byte client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Azureus-style id with the Undertow client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-UT0100-");
        rand::rng().fill(&mut id[8..]);
        Self(id)
    }
}

/// Opening exchange of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Handshake advertising extension protocol support.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    /// # Errors
    ///
    /// - `EngineError::Protocol` - Wrong protocol string
    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, EngineError> {
        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
            return Err(protocol_error("Not a BitTorrent handshake"));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}

/// Messages exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield { bitfield: Bytes },
    Request { piece: u32, offset: u32, length: u32 },
    Piece { piece: u32, offset: u32, data: Bytes },
    Cancel { piece: u32, offset: u32, length: u32 },
    Port { port: u16 },
    /// BEP 10 extended message; id 0 is the extension handshake
    Extended { id: u8, payload: Bytes },
}

fn protocol_error(message: impl Into<String>) -> EngineError {
    EngineError::Protocol {
        message: message.into(),
    }
}

impl PeerMessage {
    /// Length-prefixed wire encoding.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            PeerMessage::KeepAlive => buf.put_u32(0),
            PeerMessage::Choke => put_header(&mut buf, 0, 0),
            PeerMessage::Unchoke => put_header(&mut buf, 1, 0),
            PeerMessage::Interested => put_header(&mut buf, 2, 0),
            PeerMessage::NotInterested => put_header(&mut buf, 3, 0),
            PeerMessage::Have { piece } => {
                put_header(&mut buf, 4, 4);
                buf.put_u32(*piece);
            }
            PeerMessage::Bitfield { bitfield } => {
                put_header(&mut buf, 5, bitfield.len());
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece,
                offset,
                length,
            } => {
                put_header(&mut buf, 6, 12);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece,
                offset,
                data,
            } => {
                put_header(&mut buf, 7, 8 + data.len());
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece,
                offset,
                length,
            } => {
                put_header(&mut buf, 8, 12);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                put_header(&mut buf, 9, 2);
                buf.put_u16(*port);
            }
            PeerMessage::Extended { id, payload } => {
                put_header(&mut buf, 20, 1 + payload.len());
                buf.put_u8(*id);
                buf.extend_from_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Decodes one frame body (without the length prefix).
    ///
    /// # Errors
    ///
    /// - `EngineError::Protocol` - Unknown id or wrong length for the id
    pub fn decode(mut body: Bytes) -> Result<Self, EngineError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }
        let id = body.get_u8();
        let fixed = |expected: usize, body: &Bytes| {
            if body.len() == expected {
                Ok(())
            } else {
                Err(protocol_error(format!(
                    "Message {id} has length {}, expected {expected}",
                    body.len()
                )))
            }
        };
        match id {
            0 => fixed(0, &body).map(|_| PeerMessage::Choke),
            1 => fixed(0, &body).map(|_| PeerMessage::Unchoke),
            2 => fixed(0, &body).map(|_| PeerMessage::Interested),
            3 => fixed(0, &body).map(|_| PeerMessage::NotInterested),
            4 => {
                fixed(4, &body)?;
                Ok(PeerMessage::Have {
                    piece: body.get_u32(),
                })
            }
            5 => Ok(PeerMessage::Bitfield { bitfield: body }),
            6 | 8 => {
                fixed(12, &body)?;
                let piece = body.get_u32();
                let offset = body.get_u32();
                let length = body.get_u32();
                Ok(if id == 6 {
                    PeerMessage::Request {
                        piece,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if body.len() < 8 {
                    return Err(protocol_error("Piece message too short"));
                }
                let piece = body.get_u32();
                let offset = body.get_u32();
                Ok(PeerMessage::Piece {
                    piece,
                    offset,
                    data: body,
                })
            }
            9 => {
                fixed(2, &body)?;
                Ok(PeerMessage::Port {
                    port: body.get_u16(),
                })
            }
            20 => {
                if body.is_empty() {
                    return Err(protocol_error("Extended message without id"));
                }
                let id = body.get_u8();
                Ok(PeerMessage::Extended { id, payload: body })
            }
            other => Err(protocol_error(format!("Unknown message id {other}"))),
        }
    }
}

fn put_header(buf: &mut BytesMut, id: u8, payload: usize) {
    buf.put_u32(1 + payload as u32);
    buf.put_u8(id);
}

/// Reads one length-prefixed message.
///
/// # Errors
///
/// - `EngineError::Io` - Connection closed or failed
/// - `EngineError::Protocol` - Oversized or malformed frame
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerMessage, EngineError> {
    let length = reader.read_u32().await? as usize;
    if length > MAX_FRAME {
        return Err(protocol_error(format!("Frame of {length} bytes exceeds limit")));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    PeerMessage::decode(Bytes::from(body))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &PeerMessage) -> Result<(), EngineError> {
    writer.write_all(&message.encode()).await?;
    Ok(())
}

/// Exchanges handshakes and checks the remote infohash.
///
/// # Errors
///
/// - `EngineError::Protocol` - Remote serves a different torrent
/// - `EngineError::Io` - Connection failed
pub async fn exchange_handshake<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.encode()).await?;
    let theirs = read_handshake(stream).await?;
    if theirs.info_hash != ours.info_hash {
        return Err(protocol_error("Peer answered for a different torrent"));
    }
    Ok(theirs)
}

/// Reads the remote handshake only; used by the inbound listener before it
/// knows which torrent the peer wants.
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Handshake, EngineError> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf).await?;
    Handshake::decode(&buf)
}

/// Packs verified flags into an MSB-first bitfield.
pub fn encode_bitfield(have: &[bool]) -> Bytes {
    let mut bytes = vec![0u8; have.len().div_ceil(8)];
    for (piece, _) in have.iter().enumerate().filter(|(_, has)| **has) {
        bytes[piece / 8] |= 0x80 >> (piece % 8);
    }
    Bytes::from(bytes)
}

/// Whether `piece` is set in an MSB-first bitfield.
pub fn bitfield_has(bitfield: &[u8], piece: u32) -> bool {
    bitfield
        .get((piece / 8) as usize)
        .is_some_and(|byte| byte & (0x80 >> (piece % 8)) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_encoding() {
        let ours = Handshake::new(InfoHash::new([7; 20]), PeerId::new([1; 20]));
        let encoded = ours.encode();
        assert_eq!(encoded[0], 19);
        assert_eq!(&encoded[1..20], b"BitTorrent protocol");
        let decoded = Handshake::decode(&encoded).unwrap();
        assert!(decoded.supports_extensions());
        assert_eq!(decoded, ours);
    }

    #[test]
    fn test_request_wire_layout() {
        let encoded = PeerMessage::Request {
            piece: 1,
            offset: 16384,
            length: 16384,
        }
        .encode();
        assert_eq!(
            &encoded[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]
        );
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        assert!(PeerMessage::decode(Bytes::from_static(&[4, 0, 0])).is_err());
        assert!(PeerMessage::decode(Bytes::from_static(&[7, 0, 0, 0])).is_err());
        assert!(PeerMessage::decode(Bytes::from_static(&[42])).is_err());
        assert_eq!(PeerMessage::decode(Bytes::new()).unwrap(), PeerMessage::KeepAlive);
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let piece = PeerMessage::Piece {
            piece: 3,
            offset: 0,
            data: Bytes::from_static(b"abc"),
        };
        let mut wire = Vec::new();
        wire.extend_from_slice(&PeerMessage::Unchoke.encode());
        wire.extend_from_slice(&piece.encode());
        let mut reader = wire.as_slice();
        assert_eq!(read_message(&mut reader).await.unwrap(), PeerMessage::Unchoke);
        assert_eq!(read_message(&mut reader).await.unwrap(), piece);
        assert!(read_message(&mut reader).await.is_err());
    }

    #[test]
    fn test_bitfield_helpers() {
        let bitfield = encode_bitfield(&[true, false, false, false, false, false, false, false, true]);
        assert_eq!(&bitfield[..], &[0x80, 0x80]);
        assert!(bitfield_has(&bitfield, 0));
        assert!(bitfield_has(&bitfield, 8));
        assert!(!bitfield_has(&bitfield, 1));
        assert!(!bitfield_has(&bitfield, 64));
    }
}
