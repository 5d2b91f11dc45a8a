//! Reader and buffer behavior observed through the service and the router.

use std::io::SeekFrom;
use std::time::Duration;

use axum::http::{StatusCode, header};
use undertow_core::UndertowConfig;
use undertow_core::session::SimulationProfile;

use crate::harness::*;

const PIECE: u32 = 16 * 1024;

#[tokio::test]
async fn test_reads_only_return_verified_pieces() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, MIB)).await;
    daemon.add(HASH).await;

    let torrent = daemon.service.torrent(info_hash()).unwrap();
    let store = torrent.store().unwrap();
    let cancel = daemon.service.shutdown_token().child_token();
    let mut reader = daemon.service.attach_reader(HASH, 0, cancel).await.unwrap();

    let start = 5 * u64::from(PIECE) + 100;
    reader.seek(SeekFrom::Start(start)).unwrap();
    let mut offset = start;
    while offset < start + 300 * KIB {
        let chunk = reader.read_chunk(40 * 1024).await.unwrap();
        assert!(!chunk.is_empty());
        let first = (offset / u64::from(PIECE)) as u32;
        let last = ((offset + chunk.len() as u64 - 1) / u64::from(PIECE)) as u32;
        for piece in first..=last {
            assert!(store.is_verified(piece), "piece {piece} returned before verification");
        }
        assert_eq!(chunk.as_ref(), &expected(offset, chunk.len())[..]);
        offset += chunk.len() as u64;
    }
}

#[tokio::test]
async fn test_engine_wants_every_windowed_piece() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 2 * MIB)).await;
    daemon.add(HASH).await;

    let torrent = daemon.service.torrent(info_hash()).unwrap();
    let cancel = daemon.service.shutdown_token().child_token();
    let mut reader = daemon.service.attach_reader(HASH, 0, cancel).await.unwrap();
    reader.seek(SeekFrom::Start(MIB)).unwrap();
    reader.read_chunk(1024).await.unwrap();

    let engine = daemon.engine.clone();
    let covered = eventually(Duration::from_secs(5), || {
        let Some(map) = engine.current_priorities(info_hash()) else {
            return false;
        };
        Some(&map) == torrent.priority_map().as_ref()
            && torrent
                .windows()
                .iter()
                .all(|window| window.iter().all(|piece| map.is_wanted(piece)))
    })
    .await;
    assert!(covered, "engine priorities never caught up with the windows");
}

#[tokio::test]
async fn test_repeated_seek_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, MIB)).await;
    daemon.add(HASH).await;

    let torrent = daemon.service.torrent(info_hash()).unwrap();
    let cancel = daemon.service.shutdown_token().child_token();
    let mut reader = daemon.service.attach_reader(HASH, 0, cancel).await.unwrap();

    reader.seek(SeekFrom::Start(600 * KIB)).unwrap();
    let first = torrent.priority_map().unwrap();
    reader.seek(SeekFrom::Start(600 * KIB)).unwrap();
    let second = torrent.priority_map().unwrap();
    assert_eq!(first, second);
    assert!(first.is_wanted((600 * KIB / u64::from(PIECE)) as u32));
}

#[tokio::test]
async fn test_final_bytes_of_short_last_piece() {
    let dir = tempfile::tempdir().unwrap();
    let length = 100 * KIB + 7;
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, length)).await;
    let id = daemon.add(HASH).await;

    let response = daemon.get_range(&format!("/files/{id}/0"), "bytes=-10").await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes {}-{}/{length}", length - 10, length - 1).as_str()
    );
    assert_eq!(body(response).await.as_ref(), &expected(length - 10, 10)[..]);

    let last = length - 1;
    let response = daemon
        .get_range(&format!("/files/{id}/0"), &format!("bytes={last}-{last}"))
        .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1");
    assert_eq!(body(response).await.as_ref(), &expected(last, 1)[..]);
}

#[tokio::test]
async fn test_reconfigure_keeps_blocked_reader() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_testing();
    config.buffer.buffer_size = 2 * u64::from(PIECE);
    config.buffer.tail_size = 0;
    let profile = SimulationProfile {
        piece_latency: Duration::from_millis(300),
        ..movie(PIECE, 256 * KIB)
    };
    let daemon = Daemon::start(dir.path(), config, profile).await;
    daemon.add(HASH).await;

    let torrent = daemon.service.torrent(info_hash()).unwrap();
    let cancel = daemon.service.shutdown_token().child_token();
    let mut reader = daemon.service.attach_reader(HASH, 0, cancel).await.unwrap();
    let pending = tokio::spawn(async move {
        let chunk = reader.read_chunk(1024).await;
        (reader, chunk)
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    daemon.service.reconfigure().await.unwrap();
    assert_eq!(torrent.reader_count(), 1);

    let (reader, chunk) = tokio::time::timeout(Duration::from_secs(10), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk.unwrap().as_ref(), &expected(0, 1024)[..]);
    assert_eq!(torrent.reader_count(), 1);

    drop(reader);
    assert!(eventually(Duration::from_secs(1), || torrent.reader_count() == 0).await);
}

#[tokio::test]
async fn test_single_slot_memory_store_streams_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_testing();
    config.storage.memory_budget = u64::from(PIECE);
    let length = 8 * u64::from(PIECE) + 333;
    let daemon = Daemon::start(dir.path(), config, movie(PIECE, length)).await;
    let id = daemon.add(HASH).await;

    let store = daemon.service.torrent(info_hash()).unwrap().store().unwrap();
    assert_eq!(store.capacity(), Some(1));

    let response = tokio::time::timeout(Duration::from_secs(20), async {
        let response = daemon.get(&format!("/files/{id}/0")).await;
        assert_eq!(response.status(), StatusCode::OK);
        body(response).await
    })
    .await
    .unwrap();
    assert_eq!(response.len() as u64, length);
    assert_eq!(response.as_ref(), &expected(0, length as usize)[..]);
    assert!(store.verified_count() <= 1);
}
