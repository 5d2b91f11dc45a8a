//! Router construction and the HTTP server loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use undertow_core::Service;

use crate::handlers::{
    add_torrent, delete_torrent, info, list_torrents, pause_torrent, reload, resume_torrent, shutdown, stream_file,
};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
}

/// All routes of the HTTP surface.
pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/add", get(add_torrent))
        .route("/torrents", get(list_torrents))
        .route("/torrents/{id}/pause", get(pause_torrent))
        .route("/torrents/{id}/resume", get(resume_torrent))
        .route("/torrents/{id}/delete", get(delete_torrent))
        .route("/files/{id}/{index}", get(stream_file))
        .route("/reload", get(reload))
        .route("/shutdown", get(shutdown))
        .route("/info", get(info))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

/// Binds `address`. Port 0 picks a free port.
///
/// # Errors
///
/// - `std::io::Error` - Address unavailable
pub async fn bind(address: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(address).await?;
    tracing::info!(address = %listener.local_addr()?, "HTTP server listening");
    Ok(listener)
}

/// Serves until the service's shutdown token fires.
///
/// # Errors
///
/// - `std::io::Error` - Accept loop failed
pub async fn run_server(listener: TcpListener, service: Arc<Service>) -> std::io::Result<()> {
    let shutdown = service.shutdown_token();
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::Value;
    use tower::ServiceExt;
    use undertow_core::session::{SimulatedEngine, SimulationProfile, event_channel};
    use undertow_core::torrent::synthetic::payload_byte;
    use undertow_core::{Context, Profile, UndertowConfig};

    use super::*;

    const PIECE: u32 = 16 * 1024;
    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";
    const MOVIE_LEN: u64 = PIECE as u64 * 6;

    async fn service(dir: &std::path::Path, profile: SimulationProfile) -> Arc<Service> {
        let context = Context::open(Profile::new(dir), Arc::new(UndertowConfig::for_testing()))
            .await
            .unwrap();
        let (events_tx, events_rx) = event_channel();
        let engine = SimulatedEngine::new(profile, events_tx);
        Service::start(context, engine, events_rx).await
    }

    fn simulation() -> SimulationProfile {
        SimulationProfile::for_testing().with_files("movie.mkv", PIECE, &[("movie.mkv", MOVIE_LEN)])
    }

    async fn get(app: &Router, uri: &str, range: Option<&str>) -> axum::response::Response {
        let mut request = Request::builder().uri(uri);
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        app.clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), simulation()).await);

        let response = get(&app, &format!("/add?infohash={HASH}&wait=1"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["id"], HASH);

        let list = json(get(&app, "/torrents", None).await).await;
        assert_eq!(list["total"], 1);
        assert_eq!(list["torrents"][0]["id"], HASH);
    }

    #[tokio::test]
    async fn test_add_without_reference_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), simulation()).await);

        let response = get(&app, "/add", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["kind"], "invalid_ref");

        let response = get(&app, "/add?uri=nonsense", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_full_file_response() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), simulation()).await);
        get(&app, &format!("/add?infohash={HASH}&wait=1"), None).await;

        let response = get(&app, &format!("/files/{HASH}/0"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[header::CONNECTION], "close");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CONTENT_LENGTH], MOVIE_LEN.to_string().as_str());
        assert_eq!(headers[header::CONTENT_TYPE], "video/x-matroska");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len() as u64, MOVIE_LEN);
        let seed = SimulationProfile::default().seed;
        assert!(
            body.iter()
                .enumerate()
                .all(|(i, byte)| *byte == payload_byte(seed, i as u64))
        );
    }

    #[tokio::test]
    async fn test_partial_and_unsatisfiable_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), simulation()).await);
        get(&app, &format!("/add?infohash={HASH}&wait=1"), None).await;

        let start = u64::from(PIECE) * 3 + 10;
        let response = get(&app, &format!("/files/{HASH}/0"), Some(&format!("bytes={start}-{}", start + 99))).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            format!("bytes {start}-{}/{MOVIE_LEN}", start + 99).as_str()
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 100);
        assert_eq!(body[0], payload_byte(SimulationProfile::default().seed, start));

        let response = get(&app, &format!("/files/{HASH}/0"), Some(&format!("bytes={MOVIE_LEN}-"))).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            format!("bytes */{MOVIE_LEN}").as_str()
        );
    }

    #[tokio::test]
    async fn test_pending_metadata_asks_to_retry() {
        let dir = tempfile::tempdir().unwrap();
        let profile = SimulationProfile {
            withhold_metadata: true,
            ..simulation()
        };
        let app = router(service(dir.path(), profile).await);
        get(&app, &format!("/add?infohash={HASH}"), None).await;

        let response = get(&app, &format!("/files/{HASH}/0"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(json(response).await["kind"], "metadata_pending");
    }

    #[tokio::test]
    async fn test_unknown_torrent_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), simulation()).await);

        for uri in [
            format!("/files/{HASH}/0"),
            format!("/torrents/{HASH}/pause"),
            format!("/torrents/{HASH}/delete"),
        ] {
            let response = get(&app, &uri, None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(json(response).await["kind"], "not_found");
        }
    }

    #[tokio::test]
    async fn test_shutdown_endpoint_cancels_service() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), simulation()).await;
        let app = router(service.clone());

        let response = get(&app, "/shutdown", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(service.shutdown_token().is_cancelled());

        let response = get(&app, &format!("/add?infohash={HASH}"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json(response).await["kind"], "shutdown");
    }
}
