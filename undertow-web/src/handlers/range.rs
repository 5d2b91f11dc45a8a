//! HTTP Range header parsing (RFC 7233 byte ranges).
//!
//! Accepts `bytes=a-b`, `bytes=a-` and suffix `bytes=-n`. Multi-range
//! requests are answered with their first range.

use axum::http::HeaderMap;
use axum::http::header::RANGE;

/// Inclusive byte range inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{total}", self.start, self.end)
    }
}

/// Outcome of matching a Range header against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable header: serve everything with 200
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Resolves the request's Range header against `total` bytes.
pub fn from_headers(headers: &HeaderMap, total: u64) -> RangeRequest {
    match headers.get(RANGE).and_then(|value| value.to_str().ok()) {
        Some(value) => parse_range(value, total),
        None => RangeRequest::Full,
    }
}

/// Parses one Range header value. Malformed headers are ignored and the
/// full entity served, as RFC 7233 allows.
pub fn parse_range(value: &str, total: u64) -> RangeRequest {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };
    let Some(first) = spec.split(',').next().map(str::trim) else {
        return RangeRequest::Full;
    };
    let Some((start, end)) = first.split_once('-') else {
        return RangeRequest::Full;
    };

    if start.is_empty() {
        let Ok(suffix) = end.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || total == 0 {
            return RangeRequest::Unsatisfiable;
        }
        return RangeRequest::Partial(ByteRange {
            start: total.saturating_sub(suffix),
            end: total - 1,
        });
    }

    let Ok(start) = start.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return RangeRequest::Full,
        }
    };
    if let Some(end) = end {
        if end < start {
            return RangeRequest::Full;
        }
    }
    if start >= total {
        return RangeRequest::Unsatisfiable;
    }
    let last = total - 1;
    RangeRequest::Partial(ByteRange {
        start,
        end: end.map_or(last, |end| end.min(last)),
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range("bytes=100-199", 1000),
            RangeRequest::Partial(ByteRange { start: 100, end: 199 })
        );
        assert_eq!(
            parse_range("bytes=500-", 1000),
            RangeRequest::Partial(ByteRange { start: 500, end: 999 })
        );
        assert_eq!(
            parse_range("bytes=-100", 1000),
            RangeRequest::Partial(ByteRange { start: 900, end: 999 })
        );
        assert_eq!(
            parse_range("bytes=-5000", 1000),
            RangeRequest::Partial(ByteRange { start: 0, end: 999 })
        );
    }

    #[test]
    fn test_end_clamped_to_file() {
        assert_eq!(
            parse_range("bytes=900-5000", 1000),
            RangeRequest::Partial(ByteRange { start: 900, end: 999 })
        );
    }

    #[test]
    fn test_multi_range_serves_first() {
        assert_eq!(
            parse_range("bytes=0-9, 20-29", 1000),
            RangeRequest::Partial(ByteRange { start: 0, end: 9 })
        );
    }

    #[test]
    fn test_unsatisfiable_and_malformed() {
        assert_eq!(parse_range("bytes=1000-", 1000), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range("bytes=0-", 0), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range("bytes=-0", 1000), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range("items=0-1", 1000), RangeRequest::Full);
        assert_eq!(parse_range("bytes=abc", 1000), RangeRequest::Full);
        assert_eq!(parse_range("bytes=9-3", 1000), RangeRequest::Full);
    }

    #[test]
    fn test_from_headers_without_range() {
        assert_eq!(from_headers(&HeaderMap::new(), 10), RangeRequest::Full);
    }

    proptest! {
        #[test]
        fn test_partial_ranges_stay_inside_file(total in 1u64..10_000_000, start in 0u64..10_000_000, len in 0u64..10_000_000) {
            let header = format!("bytes={start}-{}", start + len);
            match parse_range(&header, total) {
                RangeRequest::Partial(range) => {
                    prop_assert!(range.start <= range.end);
                    prop_assert!(range.end < total);
                    prop_assert_eq!(range.start, start);
                }
                RangeRequest::Unsatisfiable => prop_assert!(start >= total),
                RangeRequest::Full => prop_assert!(false, "well-formed header ignored"),
            }
        }
    }
}
