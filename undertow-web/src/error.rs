//! Mapping of core error kinds onto HTTP responses.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use undertow_core::streaming::ReadError;
use undertow_core::{ErrorKind, MetainfoError, ServiceError};

/// Seconds a client should wait before retrying a pending torrent.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Error body: `{"kind": "...", "detail": "..."}`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

/// HTTP status of an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRef => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::MetadataPending | ErrorKind::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::MetadataTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
        ErrorKind::ConfigurationError
        | ErrorKind::PersistenceFailure
        | ErrorKind::PieceHashMismatch
        | ErrorKind::Stalled
        | ErrorKind::EvictionRefused
        | ErrorKind::ReaderCancelled
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry = self.kind == ErrorKind::MetadataPending;
        let mut response = (status, Json(self)).into_response();
        if retry {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

impl From<MetainfoError> for ApiError {
    fn from(error: MetainfoError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

impl From<ReadError> for ApiError {
    fn from(error: ReadError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::InvalidRef), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::MetadataTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::StorageFull), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(status_for(ErrorKind::InvalidRange), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_pending_carries_retry_after() {
        let response = ApiError::new(ErrorKind::MetadataPending, "waiting").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from(RETRY_AFTER_SECS)
        );

        let response = ApiError::new(ErrorKind::NotFound, "gone").into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
