//! Tracker announces over HTTP (BEP 3, compact BEP 23) and UDP (BEP 15).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use super::protocol::PeerId;
use super::udp_tracker;
use crate::session::EngineError;
use crate::torrent::InfoHash;
use crate::torrent::bencode;

/// Announce event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    /// Periodic re-announce
    None,
}

impl AnnounceEvent {
    fn as_query(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::None => None,
        }
    }

    pub(super) fn udp_code(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Parameters of one announce.
#[derive(Debug, Clone, Copy)]
pub struct Announce {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
}

/// Peers and re-announce interval returned by a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

fn tracker_error(url: &str, reason: impl Into<String>) -> EngineError {
    EngineError::Tracker {
        url: url.to_string(),
        reason: reason.into(),
    }
}

/// Announces to `url`, choosing HTTP or UDP by scheme.
///
/// # Errors
///
/// - `EngineError::Tracker` - Unsupported scheme, transport failure or tracker rejection
pub async fn announce(
    client: &reqwest::Client,
    url: &str,
    request: &Announce,
    timeout: Duration,
) -> Result<AnnounceResponse, EngineError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        announce_http(client, url, request, timeout).await
    } else if url.starts_with("udp://") {
        udp_tracker::announce(url, request, timeout).await
    } else {
        Err(tracker_error(url, "Unsupported tracker scheme"))
    }
}

async fn announce_http(
    client: &reqwest::Client,
    url: &str,
    request: &Announce,
    timeout: Duration,
) -> Result<AnnounceResponse, EngineError> {
    let full = build_announce_url(url, request);
    let response = client
        .get(&full)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| tracker_error(url, e.to_string()))?;
    if !response.status().is_success() {
        return Err(tracker_error(url, format!("HTTP {}", response.status())));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| tracker_error(url, e.to_string()))?;
    parse_announce_response(url, &body)
}

/// Percent-encodes every byte; trackers expect raw binary escapes.
fn url_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("%{b:02X}")).collect()
}

pub(super) fn build_announce_url(url: &str, request: &Announce) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    let mut full = format!(
        "{url}{separator}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        url_encode_bytes(request.info_hash.as_bytes()),
        url_encode_bytes(request.peer_id.as_bytes()),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
        request.numwant,
    );
    if let Some(event) = request.event.as_query() {
        full.push_str("&event=");
        full.push_str(event);
    }
    full
}

/// # Errors
///
/// - `EngineError::Tracker` - Malformed body or a `failure reason`
pub(super) fn parse_announce_response(url: &str, body: &[u8]) -> Result<AnnounceResponse, EngineError> {
    let dict = bencode::parse_root_dict(body).map_err(|e| tracker_error(url, e.to_string()))?;
    if let Some(reason) = bencode::get_str(&dict, b"failure reason") {
        return Err(tracker_error(url, reason));
    }
    let interval = bencode::get_int(&dict, b"interval")
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(Duration::from_secs(1800));

    let peers = match dict.get(b"peers".as_slice()) {
        Some(bencode_rs::Value::Bytes(compact)) => parse_compact_peers(compact)
            .ok_or_else(|| tracker_error(url, "Invalid compact peer list"))?,
        Some(bencode_rs::Value::List(entries)) => entries
            .iter()
            .filter_map(|entry| match entry {
                bencode_rs::Value::Dictionary(peer) => {
                    let ip: Ipv4Addr = bencode::get_str(peer, b"ip")?.parse().ok()?;
                    let port = u16::try_from(bencode::get_int(peer, b"port")?).ok()?;
                    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(AnnounceResponse { interval, peers })
}

/// Parses 6-byte IPv4 peer entries; `None` when the length is not a multiple of 6.
pub fn parse_compact_peers(bytes: &[u8]) -> Option<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .filter(|addr| addr.port() != 0)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Announce {
        Announce {
            info_hash: InfoHash::new([0xAB; 20]),
            peer_id: PeerId::new(*b"-UT0100-abcdefghijkl"),
            port: 6881,
            uploaded: 0,
            downloaded: 10,
            left: 90,
            event: AnnounceEvent::Started,
            numwant: 50,
        }
    }

    #[test]
    fn test_announce_url_escapes_binary_fields() {
        let url = build_announce_url("http://t.example/announce?key=1", &request());
        assert!(url.starts_with("http://t.example/announce?key=1&info_hash=%AB%AB"));
        assert!(url.contains("&left=90&compact=1"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn test_parse_compact_response() {
        let mut body = b"d8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]);
        body.push(b'e');
        let response = parse_announce_response("http://t", &body).unwrap();
        assert_eq!(response.interval, Duration::from_secs(900));
        assert_eq!(
            response.peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:6882".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_failure_reason_is_an_error() {
        let body = b"d14:failure reason12:unregisterede";
        let err = parse_announce_response("http://t", body).unwrap_err();
        assert!(matches!(err, EngineError::Tracker { reason, .. } if reason == "unregistered"));
    }

    #[test]
    fn test_compact_length_must_be_multiple_of_six() {
        assert!(parse_compact_peers(&[1, 2, 3, 4, 5]).is_none());
        assert_eq!(parse_compact_peers(&[]).unwrap(), Vec::<SocketAddr>::new());
    }
}
