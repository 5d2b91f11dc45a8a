//! JSON control endpoints: add, list, pause/resume/delete, reload,
//! shutdown and diagnostics.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use undertow_core::ErrorKind;
use undertow_core::service::ServiceInfo;
use undertow_core::torrent::{MediaContext, MediaType, TorrentRef, TorrentSnapshot};

use crate::error::ApiError;
use crate::server::AppState;

/// `/add` query: a reference plus optional media context.
#[derive(Debug, Default, Deserialize)]
pub struct AddTorrentQuery {
    /// Magnet link, .torrent URL or local path
    pub uri: Option<String>,
    pub infohash: Option<String>,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub tmdb: Option<i64>,
    pub show: Option<i64>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub query: Option<String>,
    /// `1` blocks until the playback file is selected
    pub wait: Option<String>,
}

impl AddTorrentQuery {
    fn media_context(&self) -> MediaContext {
        MediaContext {
            media_type: self.media_type.as_deref().map(MediaType::parse).unwrap_or_default(),
            media_id: self.tmdb.unwrap_or(0),
            show_id: self.show,
            season: self.season,
            episode: self.episode,
            query: self.query.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub files: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TorrentList {
    pub torrents: Vec<TorrentSnapshot>,
    pub total: usize,
}

/// `1`, `true` and `yes` are set; anything else is unset.
pub(crate) fn flag(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes")
    )
}

pub async fn add_torrent(
    State(state): State<AppState>,
    Query(params): Query<AddTorrentQuery>,
) -> Result<Json<Value>, ApiError> {
    let input = params
        .uri
        .as_deref()
        .or(params.infohash.as_deref())
        .filter(|input| !input.trim().is_empty())
        .ok_or_else(|| ApiError::new(ErrorKind::InvalidRef, "uri or infohash is required"))?;
    let reference = TorrentRef::parse(input)?;
    let wait = flag(params.wait.as_deref()) || state.service.config().service.wait_for_metadata;

    let info_hash = state
        .service
        .add(reference, params.media_context(), wait)
        .await?;
    Ok(Json(json!({ "id": info_hash })))
}

pub async fn list_torrents(State(state): State<AppState>) -> Json<TorrentList> {
    let torrents = state.service.list().await;
    Json(TorrentList {
        total: torrents.len(),
        torrents,
    })
}

pub async fn pause_torrent(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.service.pause(&id)?;
    Ok(Json(json!({ "id": id, "paused": true })))
}

pub async fn resume_torrent(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.service.resume(&id)?;
    Ok(Json(json!({ "id": id, "paused": false })))
}

pub async fn delete_torrent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteQuery>,
) -> Result<Json<Value>, ApiError> {
    let delete_files = params.files.as_deref().map(|value| flag(Some(value)));
    state.service.remove(&id, delete_files).await?;
    Ok(Json(json!({ "id": id, "removed": true })))
}

pub async fn reload(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.service.reconfigure().await?;
    Ok(Json(json!({ "reloaded": true })))
}

pub async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    state.service.request_shutdown();
    Json(json!({ "shutdown": true }))
}

pub async fn info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(state.service.info().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert!(flag(Some("1")));
        assert!(flag(Some("TRUE")));
        assert!(!flag(Some("0")));
        assert!(!flag(None));
    }

    #[test]
    fn test_media_context_from_query() {
        let query = AddTorrentQuery {
            media_type: Some("episode".to_string()),
            tmdb: Some(42),
            season: Some(1),
            episode: Some(3),
            ..AddTorrentQuery::default()
        };
        let context = query.media_context();
        assert_eq!(context.media_type, MediaType::Episode);
        assert_eq!(context.media_id, 42);
        assert_eq!(context.episode, Some(3));
    }
}
