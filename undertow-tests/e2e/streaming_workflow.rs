//! Streaming workflows: magnet to first bytes, pause and resume mid-stream,
//! seeking far ahead, and eviction under a tight memory budget.

use std::io::SeekFrom;
use std::time::Duration;

use axum::http::{StatusCode, header};
use axum::response::Response;
use futures::StreamExt;
use undertow_core::UndertowConfig;
use undertow_core::storage::StoreError;
use undertow_core::torrent::TorrentState;

use crate::harness::*;

const PIECE: u32 = 64 * 1024;

/// GETs `uri`, honoring 503 + Retry-After while metadata is pending.
async fn get_when_ready(daemon: &Daemon, uri: &str, range: &str) -> Response {
    for _ in 0..100 {
        let response = daemon.get_range(uri, range).await;
        if response.status() != StatusCode::SERVICE_UNAVAILABLE {
            return response;
        }
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{uri} never became ready");
}

#[tokio::test]
async fn test_magnet_to_range_stream() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 16 * MIB)).await;

    let response = daemon.get(&format!("/add?uri={}", urlencoding::encode(MAGNET))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["id"], HASH);

    let response = get_when_ready(&daemon, &format!("/files/{HASH}/0"), "bytes=0-1048575").await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1048576");
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes 0-1048575/{}", 16 * MIB).as_str()
    );
    assert_eq!(response.headers()[header::CONNECTION], "close");

    let bytes = body(response).await;
    assert_eq!(bytes.len(), 1_048_576);
    assert_eq!(bytes.as_ref(), &expected(0, 1_048_576)[..]);
}

#[tokio::test]
async fn test_pause_and_resume_preserve_offset() {
    let dir = tempfile::tempdir().unwrap();
    let length = 16 * MIB;
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, length)).await;
    let id = daemon.add(MAGNET).await;

    let response = daemon.get(&format!("/files/{id}/0")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut stream = response.into_body().into_data_stream();

    let mut received = Vec::with_capacity(length as usize);
    while (received.len() as u64) < 10 * MIB {
        let chunk = stream.next().await.unwrap().unwrap();
        received.extend_from_slice(&chunk);
    }

    let response = daemon.get(&format!("/torrents/{id}/pause")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let torrent = daemon.service.torrent(info_hash()).unwrap();
    assert_eq!(torrent.state(), TorrentState::Paused);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let response = daemon.get(&format!("/torrents/{id}/resume")).await;
    assert_eq!(response.status(), StatusCode::OK);

    while let Some(chunk) = stream.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(received.len() as u64, length);
    assert!(received == expected(0, length as usize), "stream lost or repeated bytes");
}

#[tokio::test]
async fn test_seek_relocates_head_window() {
    let dir = tempfile::tempdir().unwrap();
    let length = 32 * MIB;
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, length)).await;
    let id = daemon.add(HASH).await;
    let uri = format!("/files/{id}/0");

    let response = daemon.get_range(&uri, "bytes=0-1048575").await;
    assert_eq!(body(response).await.len() as u64, MIB);

    let far = 16 * MIB;
    let response = tokio::time::timeout(
        Duration::from_secs(30),
        daemon.get_range(&uri, &format!("bytes={far}-{}", far + MIB - 1)),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

    let engine = daemon.engine.clone();
    let far_piece = (far / u64::from(PIECE)) as u32;
    let relocated = eventually(Duration::from_secs(5), || {
        engine
            .current_priorities(info_hash())
            .is_some_and(|map| !map.is_wanted(0) && !map.is_wanted(1) && map.is_wanted(far_piece))
    })
    .await;
    assert!(relocated, "priorities around offset 0 were not dropped");

    let bytes = tokio::time::timeout(Duration::from_secs(30), body(response))
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), &expected(far, MIB as usize)[..]);
}

#[tokio::test]
async fn test_eviction_respects_pins() {
    const SMALL: u32 = 16 * 1024;
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_testing();
    config.storage.memory_budget = 4 * u64::from(SMALL);
    config.buffer.buffer_size = 3 * u64::from(SMALL);
    config.buffer.tail_size = 0;
    let daemon = Daemon::start(dir.path(), config, movie(SMALL, 100 * u64::from(SMALL))).await;
    daemon.add(HASH).await;

    let torrent = daemon.service.torrent(info_hash()).unwrap();
    let store = torrent.store().unwrap();
    assert_eq!(store.capacity(), Some(4));
    assert!(eventually(Duration::from_secs(5), || store.is_verified(0)).await);

    // A read of piece 0 is in flight for the whole test.
    let in_flight = store.pin(0);

    let cancel = daemon.service.shutdown_token().child_token();
    let mut reader = daemon.service.attach_reader(HASH, 0, cancel).await.unwrap();
    reader.seek(SeekFrom::Start(u64::from(SMALL))).unwrap();
    let end = 20 * u64::from(SMALL);
    while reader.position() < end {
        let offset = reader.position();
        let chunk = tokio::time::timeout(Duration::from_secs(10), reader.read_chunk(SMALL as usize))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.as_ref(), &expected(offset, chunk.len())[..]);
        assert!(store.is_verified(0), "pinned piece was evicted");
        assert!(store.verified_count() <= 4);
    }

    // Every slot now holds a pinned or windowed piece: a block for a piece
    // outside the windows has nowhere to go.
    assert!(eventually(Duration::from_secs(5), || store.verified_count() == 4).await);
    let pins: Vec<_> = (0..store.piece_count())
        .filter(|piece| store.is_verified(*piece))
        .map(|piece| store.pin(piece))
        .collect();
    let outside = 99;
    let block = expected(u64::from(outside) * u64::from(SMALL), SMALL as usize);
    assert!(matches!(
        store.write_block(outside, 0, &block),
        Err(StoreError::EvictionRefused { piece: 99 })
    ));
    assert!(store.is_verified(0));

    drop(pins);
    drop(in_flight);
}
