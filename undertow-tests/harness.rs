//! Shared fixtures: an in-process daemon over the simulated swarm, driven
//! through the axum router without a socket.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;
use tower::ServiceExt;
use undertow_core::session::{SimulatedEngine, SimulationProfile, event_channel};
use undertow_core::torrent::synthetic::payload_byte;
use undertow_core::{Context, InfoHash, Profile, Service, UndertowConfig};

pub const HASH: &str = "0123456789abcdef0123456789abcdef01234567";
pub const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

pub fn info_hash() -> InfoHash {
    HASH.parse().unwrap()
}

/// Single-file swarm serving `length` bytes named `movie.mkv`.
pub fn movie(piece_length: u32, length: u64) -> SimulationProfile {
    SimulationProfile::for_testing().with_files("movie.mkv", piece_length, &[("movie.mkv", length)])
}

/// Payload bytes the simulated swarm serves at torrent offset `offset`.
pub fn expected(offset: u64, length: usize) -> Vec<u8> {
    let seed = SimulationProfile::default().seed;
    (0..length as u64)
        .map(|i| payload_byte(seed, offset + i))
        .collect()
}

pub struct Daemon {
    pub service: Arc<Service>,
    pub engine: Arc<SimulatedEngine>,
    pub app: Router,
}

impl Daemon {
    pub async fn start(dir: &Path, config: UndertowConfig, profile: SimulationProfile) -> Self {
        let context = Context::open(Profile::new(dir), Arc::new(config)).await.unwrap();
        Self::with_context(context, profile).await
    }

    pub async fn with_context(context: Context, profile: SimulationProfile) -> Self {
        let (events_tx, events_rx) = event_channel();
        let engine = SimulatedEngine::new(profile, events_tx);
        let service = Service::start(context, engine.clone(), events_rx).await;
        let app = undertow_web::router(Arc::clone(&service));
        Self { service, engine, app }
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.request(uri, None).await
    }

    pub async fn get_range(&self, uri: &str, range: &str) -> Response {
        self.request(uri, Some(range)).await
    }

    async fn request(&self, uri: &str, range: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        self.app
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    /// Adds `reference` and waits for file selection; returns the id.
    pub async fn add(&self, reference: &str) -> String {
        let response = self
            .get(&format!("/add?uri={}&wait=1", urlencoding::encode(reference)))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        json(response).await["id"].as_str().unwrap().to_string()
    }

    pub async fn shutdown(self) {
        self.service.shutdown().await;
    }
}

pub async fn body(response: Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

pub async fn json(response: Response) -> Value {
    serde_json::from_slice(&body(response).await).unwrap()
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
