//! UDP tracker protocol (BEP 15).

use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;

use super::tracker::{Announce, AnnounceResponse, parse_compact_peers};
use crate::session::EngineError;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const CONNECT_LEN: usize = 16;
const ANNOUNCE_HEADER_LEN: usize = 20;

fn tracker_error(url: &str, reason: impl Into<String>) -> EngineError {
    EngineError::Tracker {
        url: url.to_string(),
        reason: reason.into(),
    }
}

fn host_port(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    Some(format!("{}:{}", parsed.host_str()?, parsed.port()?))
}

pub(super) fn connect_request(transaction: u32) -> [u8; CONNECT_LEN] {
    let mut buf = [0u8; CONNECT_LEN];
    buf[..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction.to_be_bytes());
    buf
}

pub(super) fn announce_request(connection: u64, transaction: u32, key: u32, request: &Announce) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    buf.extend_from_slice(&connection.to_be_bytes());
    buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buf.extend_from_slice(&transaction.to_be_bytes());
    buf.extend_from_slice(request.info_hash.as_bytes());
    buf.extend_from_slice(request.peer_id.as_bytes());
    buf.extend_from_slice(&request.downloaded.to_be_bytes());
    buf.extend_from_slice(&request.left.to_be_bytes());
    buf.extend_from_slice(&request.uploaded.to_be_bytes());
    buf.extend_from_slice(&request.event.udp_code().to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&key.to_be_bytes());
    buf.extend_from_slice(&request.numwant.to_be_bytes());
    buf.extend_from_slice(&request.port.to_be_bytes());
    buf
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Checks action and transaction of a response header, surfacing tracker
/// error messages.
fn check_header(url: &str, buf: &[u8], action: u32, transaction: u32) -> Result<(), EngineError> {
    if buf.len() < 8 {
        return Err(tracker_error(url, "Truncated response"));
    }
    if read_u32(buf, 4) != transaction {
        return Err(tracker_error(url, "Transaction id mismatch"));
    }
    match read_u32(buf, 0) {
        found if found == action => Ok(()),
        ACTION_ERROR => Err(tracker_error(url, String::from_utf8_lossy(&buf[8..]).into_owned())),
        other => Err(tracker_error(url, format!("Unexpected action {other}"))),
    }
}

pub(super) fn parse_announce(url: &str, buf: &[u8], transaction: u32) -> Result<AnnounceResponse, EngineError> {
    check_header(url, buf, ACTION_ANNOUNCE, transaction)?;
    if buf.len() < ANNOUNCE_HEADER_LEN {
        return Err(tracker_error(url, "Truncated announce response"));
    }
    let interval = Duration::from_secs(u64::from(read_u32(buf, 8).max(60)));
    let peers = parse_compact_peers(&buf[ANNOUNCE_HEADER_LEN..])
        .ok_or_else(|| tracker_error(url, "Invalid peer list"))?;
    Ok(AnnounceResponse { interval, peers })
}

async fn exchange(socket: &UdpSocket, url: &str, request: &[u8], timeout: Duration) -> Result<Vec<u8>, EngineError> {
    socket.send(request).await?;
    let mut buf = vec![0u8; 2048];
    let received = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| tracker_error(url, "Timed out"))??;
    buf.truncate(received);
    Ok(buf)
}

/// Connects and announces in one exchange pair.
///
/// # Errors
///
/// - `EngineError::Tracker` - Bad URL, timeout or protocol violation
/// - `EngineError::Io` - Socket failure
pub async fn announce(url: &str, request: &Announce, timeout: Duration) -> Result<AnnounceResponse, EngineError> {
    let target = host_port(url).ok_or_else(|| tracker_error(url, "Invalid UDP tracker URL"))?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&target).await?;

    let (connect_tx, announce_tx, key) = {
        let mut rng = rand::rng();
        (rng.random::<u32>(), rng.random::<u32>(), rng.random::<u32>())
    };

    let response = exchange(&socket, url, &connect_request(connect_tx), timeout).await?;
    check_header(url, &response, ACTION_CONNECT, connect_tx)?;
    if response.len() < CONNECT_LEN {
        return Err(tracker_error(url, "Truncated connect response"));
    }
    let mut connection = [0u8; 8];
    connection.copy_from_slice(&response[8..16]);
    let connection = u64::from_be_bytes(connection);

    let payload = announce_request(connection, announce_tx, key, request);
    let response = exchange(&socket, url, &payload, timeout).await?;
    parse_announce(url, &response, announce_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::wire::protocol::PeerId;
    use crate::session::wire::tracker::AnnounceEvent;
    use crate::torrent::InfoHash;

    fn request() -> Announce {
        Announce {
            info_hash: InfoHash::new([1; 20]),
            peer_id: PeerId::new([2; 20]),
            port: 6881,
            uploaded: 3,
            downloaded: 4,
            left: 5,
            event: AnnounceEvent::Started,
            numwant: 50,
        }
    }

    #[test]
    fn test_request_layouts() {
        let connect = connect_request(7);
        assert_eq!(&connect[..8], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&connect[12..], &7u32.to_be_bytes());

        let announce = announce_request(9, 11, 13, &request());
        assert_eq!(announce.len(), 98);
        assert_eq!(&announce[..8], &9u64.to_be_bytes());
        assert_eq!(&announce[80..84], &2u32.to_be_bytes());
        assert_eq!(&announce[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_parse_announce_response() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&900u32.to_be_bytes());
        buf.extend_from_slice(&[0; 8]);
        buf.extend_from_slice(&[192, 168, 1, 9, 0x1A, 0xE1]);
        let response = parse_announce("udp://t:1", &buf, 5).unwrap();
        assert_eq!(response.interval, Duration::from_secs(900));
        assert_eq!(response.peers, vec!["192.168.1.9:6881".parse().unwrap()]);

        assert!(parse_announce("udp://t:1", &buf, 6).is_err());
    }

    #[test]
    fn test_error_action_carries_message() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"torrent not registered");
        let err = parse_announce("udp://t:1", &buf, 5).unwrap_err();
        assert!(err.to_string().contains("torrent not registered"));
    }

    #[tokio::test]
    async fn test_announce_against_local_tracker() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}/announce", server.local_addr().unwrap());
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&42u64.to_be_bytes());
            server.send_to(&reply, from).await.unwrap();

            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 98);
            assert_eq!(&buf[..8], &42u64.to_be_bytes());
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&120u32.to_be_bytes());
            reply.extend_from_slice(&[0; 8]);
            reply.extend_from_slice(&[127, 0, 0, 1, 0x1F, 0x90]);
            server.send_to(&reply, from).await.unwrap();
        });

        let response = announce(&url, &request(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.peers, vec!["127.0.0.1:8080".parse().unwrap()]);
    }
}
