//! HTTP status contract of the control and file endpoints.

use std::time::Duration;

use axum::http::{StatusCode, header};
use undertow_core::UndertowConfig;
use undertow_core::config::StoragePolicyKind;
use undertow_core::session::SimulationProfile;

use crate::harness::*;

const PIECE: u32 = 16 * 1024;

#[tokio::test]
async fn test_add_rejects_invalid_reference() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 64 * KIB)).await;

    for uri in ["/add", "/add?uri=", "/add?uri=definitely-not-a-torrent", "/add?infohash=abc"] {
        let response = daemon.get(uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(json(response).await["kind"], "invalid_ref");
    }
    assert!(daemon.service.list().await.is_empty());
}

#[tokio::test]
async fn test_unknown_torrent_routes_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 64 * KIB)).await;

    for uri in [
        format!("/files/{HASH}/0"),
        format!("/torrents/{HASH}/pause"),
        format!("/torrents/{HASH}/resume"),
        format!("/torrents/{HASH}/delete"),
        "/torrents/not-an-id/pause".to_string(),
    ] {
        let response = daemon.get(&uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        let error = json(response).await;
        assert_eq!(error["kind"], "not_found");
        assert!(error["detail"].as_str().is_some());
    }
}

#[tokio::test]
async fn test_pending_metadata_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let profile = SimulationProfile {
        withhold_metadata: true,
        ..movie(PIECE, 64 * KIB)
    };
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), profile).await;

    let response = daemon.get(&format!("/add?uri={}", urlencoding::encode(MAGNET))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = daemon.get(&format!("/files/{HASH}/0")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "5");
    assert_eq!(json(response).await["kind"], "metadata_pending");
}

#[tokio::test]
async fn test_wait_for_metadata_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_testing();
    config.service.metadata_timeout_secs = 1;
    let profile = SimulationProfile {
        withhold_metadata: true,
        ..movie(PIECE, 64 * KIB)
    };
    let daemon = Daemon::start(dir.path(), config, profile).await;

    let response = daemon.get(&format!("/add?infohash={HASH}&wait=1")).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json(response).await["kind"], "metadata_timeout");

    let list = json(daemon.get("/torrents").await).await;
    assert_eq!(list["torrents"][0]["state"], "error");
    assert_eq!(list["torrents"][0]["error"], "metadata_timeout");
}

#[tokio::test]
async fn test_range_past_end_answers_without_waiting_for_data() {
    let dir = tempfile::tempdir().unwrap();
    let length = 100 * KIB + 7;
    let profile = SimulationProfile {
        piece_latency: Duration::from_secs(600),
        ..movie(PIECE, length)
    };
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), profile).await;
    let id = daemon.add(HASH).await;

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        daemon.get_range(&format!("/files/{id}/0"), &format!("bytes={length}-")),
    )
    .await
    .expect("416 must not wait for pieces");
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes */{length}").as_str()
    );
    assert_eq!(json(response).await["kind"], "invalid_range");
}

#[tokio::test]
async fn test_pause_resume_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 256 * KIB)).await;
    let id = daemon.add(MAGNET).await;
    assert_eq!(id, HASH);

    let response = daemon.get(&format!("/torrents/{id}/pause")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["paused"], true);
    let list = json(daemon.get("/torrents").await).await;
    assert_eq!(list["total"], 1);
    assert_eq!(list["torrents"][0]["state"], "paused");
    assert_eq!(list["torrents"][0]["name"], "movie.mkv");

    let response = daemon.get(&format!("/torrents/{id}/resume")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let list = json(daemon.get("/torrents").await).await;
    assert_ne!(list["torrents"][0]["state"], "paused");
}

#[tokio::test]
async fn test_delete_with_files_removes_payload() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_testing();
    config.storage.policy = StoragePolicyKind::File;
    config.reaper.delete_files_on_remove = false;
    let daemon = Daemon::start(dir.path(), config, movie(PIECE, 128 * KIB)).await;
    let id = daemon.add(HASH).await;

    let profile = &daemon.service.context().profile;
    let payload = profile.payload_dir(&profile.downloads_dir(), info_hash());
    assert!(payload.exists());

    let response = daemon.get(&format!("/torrents/{id}/delete?files=1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["removed"], true);
    assert!(!payload.exists());
    assert!(!daemon.engine.contains(info_hash()));
    assert_eq!(json(daemon.get("/torrents").await).await["total"], 0);

    let response = daemon.get(&format!("/files/{id}/0")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_keeps_payload_by_default_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_testing();
    config.storage.policy = StoragePolicyKind::File;
    config.reaper.delete_files_on_remove = false;
    let daemon = Daemon::start(dir.path(), config, movie(PIECE, 128 * KIB)).await;
    let id = daemon.add(HASH).await;

    let response = daemon.get(&format!("/torrents/{id}/delete")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let profile = &daemon.service.context().profile;
    assert!(profile.payload_dir(&profile.downloads_dir(), info_hash()).exists());
}

#[tokio::test]
async fn test_reload_and_info() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 64 * KIB)).await;
    daemon.add(HASH).await;

    let response = daemon.get("/reload").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(daemon.engine.reconfigure_count(), 1);

    let info = json(daemon.get("/info").await).await;
    assert_eq!(info["engine"], "simulated");
    assert_eq!(info["session"], "running");
    assert_eq!(info["torrents"], 1);
    assert_eq!(info["storage_policy"], "memory");
    assert!(info["schema_version"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_shutdown_refuses_further_work() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), UndertowConfig::for_testing(), movie(PIECE, 64 * KIB)).await;

    let response = daemon.get("/shutdown").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(daemon.service.shutdown_token().is_cancelled());

    let response = daemon.get(&format!("/add?infohash={HASH}")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json(response).await["kind"], "shutdown");
}
