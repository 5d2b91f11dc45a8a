//! Torrent lifecycle across the maintenance tick and across a daemon crash.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use undertow_core::config::StoragePolicyKind;
use undertow_core::session::SimulationProfile;
use undertow_core::torrent::TorrentItemState;
use undertow_core::{SwarmEngine, UndertowConfig};

use crate::harness::*;

const PIECE: u32 = 64 * 1024;

fn reaping_config() -> UndertowConfig {
    let mut config = UndertowConfig::for_testing();
    config.reaper.tick_secs = 1;
    config.reaper.idle_timeout_secs = 1;
    config
}

/// Kills the swarm and stops serving without the orderly service shutdown.
async fn crash(daemon: Daemon) {
    daemon.engine.shutdown().await.unwrap();
    daemon.service.request_shutdown();
    drop(daemon);
}

#[tokio::test]
async fn test_idle_torrent_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), reaping_config(), movie(PIECE, 4 * MIB)).await;
    daemon.add(HASH).await;

    let service = Arc::clone(&daemon.service);
    let gone = eventually(Duration::from_secs(10), || service.torrent(info_hash()).is_none()).await;
    assert!(gone, "idle torrent was never reaped");
    assert!(!daemon.engine.contains(info_hash()));

    let item = daemon
        .service
        .context()
        .database
        .item(info_hash())
        .await
        .unwrap()
        .expect("reaped item must be kept as removed");
    assert_eq!(item.state, TorrentItemState::Removed);
    assert_eq!(json(daemon.get("/torrents").await).await["total"], 0);
    assert_eq!(
        daemon.get(&format!("/files/{HASH}/0")).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_attached_reader_keeps_torrent_alive() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), reaping_config(), movie(PIECE, 4 * MIB)).await;
    daemon.add(HASH).await;

    let cancel = daemon.service.shutdown_token().child_token();
    let reader = daemon.service.attach_reader(HASH, 0, cancel).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(daemon.service.torrent(info_hash()).is_some());
    assert!(daemon.engine.contains(info_hash()));

    drop(reader);
    let service = Arc::clone(&daemon.service);
    let gone = eventually(Duration::from_secs(10), || service.torrent(info_hash()).is_none()).await;
    assert!(gone, "torrent outlived its last reader");
}

#[tokio::test]
async fn test_file_store_resumes_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_testing();
    config.storage.policy = StoragePolicyKind::File;
    let length = 8 * MIB;

    let first = Daemon::start(dir.path(), config.clone(), movie(PIECE, length)).await;
    let id = first.add(MAGNET).await;
    let response = first.get_range(&format!("/files/{id}/0"), "bytes=0-1048575").await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body(response).await.as_ref(), &expected(0, MIB as usize)[..]);
    let store = first.service.torrent(info_hash()).unwrap().store().unwrap();
    assert!(store.is_verified(0));
    drop(store);
    crash(first).await;

    // The swarm no longer serves anything: every byte must come from disk.
    let starved = SimulationProfile {
        piece_latency: Duration::from_secs(600),
        ..movie(PIECE, length)
    };
    let second = Daemon::start(dir.path(), config, starved).await;
    let torrent = second.service.torrent(info_hash()).expect("active item must be resumed");
    assert!(
        eventually(Duration::from_secs(5), || {
            torrent.store().is_some_and(|store| store.verified_count() > 0)
        })
        .await,
        "verified pieces were not reused"
    );

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        second.get_range(&format!("/files/{id}/0"), "bytes=0-65535"),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body(response).await.as_ref(), &expected(0, 65_536)[..]);
}

#[tokio::test]
async fn test_memory_store_starts_empty_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_testing();
    config.buffer.buffer_size = u64::from(PIECE);
    config.buffer.tail_size = u64::from(PIECE);
    let length = 2 * MIB;

    let first = Daemon::start(dir.path(), config.clone(), movie(PIECE, length)).await;
    let id = first.add(HASH).await;
    let response = first.get_range(&format!("/files/{id}/0"), "bytes=0-65535").await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    body(response).await;
    crash(first).await;

    let slow = SimulationProfile {
        piece_latency: Duration::from_millis(200),
        ..movie(PIECE, length)
    };
    let second = Daemon::start(dir.path(), config, slow).await;
    let torrent = second.service.torrent(info_hash()).expect("active item must be resumed");
    assert!(eventually(Duration::from_secs(5), || torrent.store().is_some()).await);
    let store = torrent.store().unwrap();
    assert_eq!(store.verified_count(), 0);

    let response = tokio::time::timeout(
        Duration::from_secs(10),
        second.get_range(&format!("/files/{id}/0"), "bytes=65536-131071"),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body(response).await.as_ref(), &expected(65_536, 65_536)[..]);
}
