//! `/files/{id}/{index}`: range-capable streaming of one torrent file.
//!
//! The body is fed by a core [`Reader`](undertow_core::Reader), so it
//! blocks on piece availability. Dropping the response (client gone)
//! drops the reader, which detaches it from the torrent.

use std::io::SeekFrom;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use undertow_core::ErrorKind;

use super::range::{self, RangeRequest};
use crate::error::ApiError;
use crate::server::AppState;

pub async fn stream_file(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let cancel = state.service.shutdown_token().child_token();
    let mut reader = state.service.attach_reader(&id, index, cancel).await?;
    let total = reader.len();
    let content_type = mime_guess::from_path(reader.file().file_name())
        .first_or_octet_stream()
        .to_string();

    let (status, length, content_range) = match range::from_headers(&headers, total) {
        RangeRequest::Unsatisfiable => {
            tracing::debug!(id, index, total, "Unsatisfiable range");
            let mut response = ApiError::new(ErrorKind::InvalidRange, format!("file has {total} bytes")).into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
        RangeRequest::Full => (StatusCode::OK, total, None),
        RangeRequest::Partial(range) => {
            reader.seek(SeekFrom::Start(range.start))?;
            (StatusCode::PARTIAL_CONTENT, range.len(), Some(range.content_range(total)))
        }
    };

    tracing::debug!(
        id,
        index,
        reader = %reader.id(),
        offset = reader.position(),
        length,
        "Streaming file"
    );

    let body = Body::from_stream(reader.into_stream(length));
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONNECTION, "close");
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    builder
        .body(body)
        .map_err(|e| ApiError::new(ErrorKind::Internal, e.to_string()))
}
