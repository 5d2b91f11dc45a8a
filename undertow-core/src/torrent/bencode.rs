//! Bencode helpers shared by metainfo, tracker and extension-protocol parsing.
//!
//! Decoding goes through `bencode_rs`; this module adds the raw-span
//! scanning needed to hash an info dictionary exactly as received, plus a
//! small encoder for the handful of dictionaries we emit ourselves.

use std::collections::HashMap;
use std::ops::Range;

use super::MetainfoError;

pub type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;

fn invalid(reason: impl Into<String>) -> MetainfoError {
    MetainfoError::InvalidTorrentFile {
        reason: reason.into(),
    }
}

/// Decodes `data` and returns its root dictionary.
///
/// # Errors
///
/// - `MetainfoError::InvalidTorrentFile` - Not bencode, empty, or root is not a dictionary
pub fn parse_root_dict(data: &[u8]) -> Result<BencodeDict<'_>, MetainfoError> {
    let parsed = bencode_rs::Value::parse(data)
        .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;
    match parsed.into_iter().next() {
        Some(bencode_rs::Value::Dictionary(dict)) => Ok(dict),
        Some(_) => Err(invalid("Root element must be dictionary")),
        None => Err(invalid("Empty bencode data")),
    }
}

pub fn get_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(bencode_rs::Value::Bytes(bytes)) => Some(bytes),
        _ => None,
    }
}

pub fn get_int(dict: &BencodeDict<'_>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) => Some(*value),
        _ => None,
    }
}

pub fn get_str(dict: &BencodeDict<'_>, key: &[u8]) -> Option<String> {
    get_bytes(dict, key).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

/// Returns the end offset (exclusive) of the bencode value starting at `pos`.
///
/// # Errors
///
/// - `MetainfoError::InvalidTorrentFile` - Truncated or malformed input
pub fn value_end(data: &[u8], pos: usize) -> Result<usize, MetainfoError> {
    match data.get(pos) {
        Some(b'i') => {
            let end = data[pos..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| invalid("Unterminated integer"))?;
            Ok(pos + end + 1)
        }
        Some(b'l') | Some(b'd') => {
            let mut cursor = pos + 1;
            loop {
                match data.get(cursor) {
                    Some(b'e') => return Ok(cursor + 1),
                    Some(_) => cursor = value_end(data, cursor)?,
                    None => return Err(invalid("Unterminated container")),
                }
            }
        }
        Some(b'0'..=b'9') => {
            let colon = data[pos..]
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| invalid("Invalid string format"))?;
            let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| invalid("Invalid string length"))?;
            let end = pos + colon + 1 + length;
            if end > data.len() {
                return Err(invalid("String exceeds input"));
            }
            Ok(end)
        }
        Some(_) => Err(invalid("Invalid bencode character")),
        None => Err(invalid("Unexpected end of input")),
    }
}

/// Locates the raw byte span of `key`'s value in the root dictionary.
///
/// Only top-level keys are considered, so a nested or string occurrence of
/// the key never matches.
///
/// # Errors
///
/// - `MetainfoError::InvalidTorrentFile` - Root is not a well-formed dictionary
pub fn top_level_value_span(data: &[u8], key: &[u8]) -> Result<Option<Range<usize>>, MetainfoError> {
    if data.first() != Some(&b'd') {
        return Err(invalid("Expected dictionary start"));
    }
    let mut cursor = 1;
    loop {
        match data.get(cursor) {
            Some(b'e') => return Ok(None),
            Some(_) => {
                let key_end = value_end(data, cursor)?;
                let colon = data[cursor..key_end]
                    .iter()
                    .position(|&b| b == b':')
                    .ok_or_else(|| invalid("Dictionary key must be a string"))?;
                let key_bytes = &data[cursor + colon + 1..key_end];
                let value_stop = value_end(data, key_end)?;
                if key_bytes == key {
                    return Ok(Some(key_end..value_stop));
                }
                cursor = value_stop;
            }
            None => return Err(invalid("Incomplete bencode dictionary")),
        }
    }
}

/// Minimal bencode writer for the dictionaries we originate.
///
/// Callers are responsible for emitting dictionary keys in sorted order.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_dict(&mut self) -> &mut Self {
        self.buf.push(b'd');
        self
    }

    pub fn begin_list(&mut self) -> &mut Self {
        self.buf.push(b'l');
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.buf.push(b'e');
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value.len().to_string().as_bytes());
        self.buf.push(b':');
        self.buf.extend_from_slice(value);
        self
    }

    pub fn int(&mut self, value: i64) -> &mut Self {
        self.buf.push(b'i');
        self.buf.extend_from_slice(value.to_string().as_bytes());
        self.buf.push(b'e');
        self
    }

    /// Appends already-encoded bencode verbatim.
    pub fn raw(&mut self, encoded: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(encoded);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_end_nested() {
        let data = b"d3:keyd4:namei42eee";
        assert_eq!(value_end(data, 0).unwrap(), data.len());
        let list = b"l4:testi42ee";
        assert_eq!(value_end(list, 0).unwrap(), list.len());
    }

    #[test]
    fn test_value_end_rejects_truncated_input() {
        assert!(value_end(b"d3:key", 0).is_err());
        assert!(value_end(b"d3:key999:", 0).is_err());
        assert!(value_end(b"i42", 0).is_err());
    }

    #[test]
    fn test_top_level_span_ignores_nested_keys() {
        // "info" appears first as a string value and nested key; only the
        // top-level key counts.
        let data = b"d7:comment4:info4:metad4:infoi1ee4:infod6:lengthi5eee";
        let span = top_level_value_span(data, b"info").unwrap().unwrap();
        assert_eq!(&data[span], b"d6:lengthi5ee");
        assert!(top_level_value_span(data, b"missing").unwrap().is_none());
    }

    #[test]
    fn test_encoder_output_parses() {
        let encoded = Encoder::new()
            .begin_dict()
            .bytes(b"m")
            .begin_dict()
            .bytes(b"ut_metadata")
            .int(3)
            .end()
            .bytes(b"metadata_size")
            .int(31235)
            .end()
            .finish();
        assert_eq!(
            encoded,
            b"d1:md11:ut_metadatai3ee13:metadata_sizei31235ee".to_vec()
        );
        let dict = parse_root_dict(&encoded).unwrap();
        assert_eq!(get_int(&dict, b"metadata_size"), Some(31235));
    }
}
