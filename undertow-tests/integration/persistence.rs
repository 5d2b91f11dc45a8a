//! Torrent records surviving a restart of the service on one profile.

use std::time::Duration;

use axum::http::StatusCode;
use undertow_core::UndertowConfig;
use undertow_core::session::SimulationProfile;
use undertow_core::torrent::{TorrentItemState, TorrentState};

use crate::harness::*;

const PIECE: u32 = 16 * 1024;

fn pack() -> SimulationProfile {
    SimulationProfile::for_testing().with_files(
        "Pack",
        PIECE,
        &[("feature.mkv", 320 * KIB), ("extras.mkv", 96 * KIB)],
    )
}

#[tokio::test]
async fn test_active_items_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let first = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 256 * KIB)).await;
    first.add(MAGNET).await;
    let item = first.service.context().database.item(info_hash()).await.unwrap().unwrap();
    assert!(item.is_active());
    first.shutdown().await;

    let second = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 256 * KIB)).await;
    let torrent = second.service.torrent(info_hash()).expect("active item must be resumed");
    assert!(second.engine.contains(info_hash()));
    assert!(
        eventually(Duration::from_secs(5), || torrent.state().has_metadata()).await,
        "resumed torrent never left {}",
        torrent.state()
    );

    let response = second.get_range(&format!("/files/{HASH}/0"), "bytes=0-99").await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body(response).await.as_ref(), &expected(0, 100)[..]);
}

#[tokio::test]
async fn test_removed_items_stay_removed() {
    let dir = tempfile::tempdir().unwrap();
    let first = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 64 * KIB)).await;
    let id = first.add(HASH).await;
    assert_eq!(first.get(&format!("/torrents/{id}/delete")).await.status(), StatusCode::OK);
    first.shutdown().await;

    let second = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 64 * KIB)).await;
    assert!(second.service.list().await.is_empty());
    assert!(!second.engine.contains(info_hash()));
    let item = second.service.context().database.item(info_hash()).await.unwrap();
    assert!(item.is_none_or(|item| item.state == TorrentItemState::Removed));
}

#[tokio::test]
async fn test_duplicate_add_reuses_torrent() {
    let dir = tempfile::tempdir().unwrap();
    let profile = SimulationProfile {
        metadata_delay: Duration::from_millis(200),
        ..movie(PIECE, 64 * KIB)
    };
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), profile).await;

    let response = daemon.get(&format!("/add?infohash={HASH}")).await;
    assert_eq!(json(response).await["id"], HASH);
    let torrent = daemon.service.torrent(info_hash()).unwrap();
    assert_eq!(torrent.state(), TorrentState::MetadataPending);

    let response = daemon.get(&format!("/add?uri={}", urlencoding::encode(MAGNET))).await;
    assert_eq!(json(response).await["id"], HASH);
    let again = daemon.service.torrent(info_hash()).unwrap();
    assert!(std::sync::Arc::ptr_eq(&torrent, &again));
    assert_eq!(daemon.service.list().await.len(), 1);
}

#[tokio::test]
async fn test_explicit_file_choice_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let first = Daemon::start(dir.path(), UndertowConfig::for_testing(), pack()).await;
    first.add(HASH).await;
    let torrent = first.service.torrent(info_hash()).unwrap();
    assert_eq!(torrent.selected_file().unwrap().file_name(), "feature.mkv");

    let cancel = first.service.shutdown_token().child_token();
    let reader = first.service.attach_reader(HASH, 1, cancel).await.unwrap();
    assert_eq!(reader.file().file_name(), "extras.mkv");
    drop(reader);
    let item = first.service.context().database.item(info_hash()).await.unwrap().unwrap();
    assert!(item.files.iter().any(|path| path.ends_with("extras.mkv")));
    first.shutdown().await;

    let second = Daemon::start(dir.path(), UndertowConfig::for_testing(), pack()).await;
    let torrent = second.service.torrent(info_hash()).unwrap();
    let restored = eventually(Duration::from_secs(5), || {
        torrent
            .selected_file()
            .is_some_and(|file| file.file_name() == "extras.mkv")
    })
    .await;
    assert!(restored, "selection was not restored");
}
