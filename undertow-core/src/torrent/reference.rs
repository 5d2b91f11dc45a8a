//! Normalization and resolution of user-supplied torrent references.

use std::path::PathBuf;
use std::sync::Arc;

use super::{InfoHash, Metainfo, MetainfoError};

/// A normalized torrent reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentRef {
    InfoHash(InfoHash),
    Magnet {
        info_hash: InfoHash,
        display_name: Option<String>,
        trackers: Vec<String>,
    },
    Path(PathBuf),
    Url(url::Url),
}

impl TorrentRef {
    /// Classifies `input` as an infohash, magnet URI, HTTP(S) URL or local path.
    ///
    /// Local paths are accepted when they end in `.torrent` or exist on disk.
    ///
    /// # Errors
    ///
    /// - `MetainfoError::InvalidRef` - Input matches none of the accepted forms
    /// - `MetainfoError::InvalidInfoHash` - Magnet link carries a malformed hash
    pub fn parse(input: &str) -> Result<Self, MetainfoError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(MetainfoError::InvalidRef {
                input: input.to_string(),
            });
        }

        if input.len() == 40 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
            return InfoHash::from_hex(input).map(TorrentRef::InfoHash);
        }

        if input.len() >= 7 && input[..7].eq_ignore_ascii_case("magnet:") {
            return parse_magnet(input);
        }

        if input.starts_with("http://") || input.starts_with("https://") {
            return url::Url::parse(input)
                .map(TorrentRef::Url)
                .map_err(|_| MetainfoError::InvalidRef {
                    input: input.to_string(),
                });
        }

        let path = input.strip_prefix("file://").unwrap_or(input);
        let path = PathBuf::from(path);
        let is_torrent = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("torrent"));
        if is_torrent || path.is_file() {
            return Ok(TorrentRef::Path(path));
        }

        Err(MetainfoError::InvalidRef {
            input: input.to_string(),
        })
    }

    /// Infohash known without any I/O, if any.
    pub fn known_info_hash(&self) -> Option<InfoHash> {
        match self {
            TorrentRef::InfoHash(info_hash) | TorrentRef::Magnet { info_hash, .. } => {
                Some(*info_hash)
            }
            TorrentRef::Path(_) | TorrentRef::Url(_) => None,
        }
    }
}

fn parse_magnet(input: &str) -> Result<TorrentRef, MetainfoError> {
    let magnet = magnet_url::Magnet::new(input).map_err(|_| MetainfoError::InvalidRef {
        input: input.to_string(),
    })?;

    let info_hash = match (magnet.hash_type(), magnet.hash()) {
        (Some(kind), Some(hash)) if kind.eq_ignore_ascii_case("btih") => hash.parse::<InfoHash>()?,
        _ => xt_from_query(input)?,
    };

    Ok(TorrentRef::Magnet {
        info_hash,
        display_name: magnet.display_name().map(|name| name.to_string()),
        trackers: magnet.trackers().to_vec(),
    })
}

/// Reads `xt=urn:btih:<hash>` straight from the query string.
fn xt_from_query(input: &str) -> Result<InfoHash, MetainfoError> {
    let query = input.split_once('?').map(|(_, q)| q).unwrap_or_default();
    query
        .split('&')
        .find_map(|param| {
            let value = param.strip_prefix("xt=")?;
            let value = value
                .strip_prefix("urn:btih:")
                .or_else(|| value.strip_prefix("urn%3Abtih%3A"))?;
            Some(value.parse::<InfoHash>())
        })
        .unwrap_or_else(|| {
            Err(MetainfoError::InvalidRef {
                input: input.to_string(),
            })
        })
}

/// What the engine is given for a torrent: metainfo when known, else just
/// enough to find the swarm.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    Bare {
        info_hash: InfoHash,
        name: Option<String>,
        trackers: Vec<String>,
    },
    Metainfo(Arc<Metainfo>),
}

impl TorrentSource {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            TorrentSource::Bare { info_hash, .. } => *info_hash,
            TorrentSource::Metainfo(metainfo) => metainfo.info_hash,
        }
    }

    pub fn metainfo(&self) -> Option<&Arc<Metainfo>> {
        match self {
            TorrentSource::Metainfo(metainfo) => Some(metainfo),
            TorrentSource::Bare { .. } => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TorrentSource::Bare { name, .. } => name.as_deref(),
            TorrentSource::Metainfo(metainfo) => Some(&metainfo.name),
        }
    }

    pub fn trackers(&self) -> &[String] {
        match self {
            TorrentSource::Bare { trackers, .. } => trackers,
            TorrentSource::Metainfo(metainfo) => &metainfo.trackers,
        }
    }
}

/// Resolves a reference into a source, fetching or reading .torrent bytes.
///
/// # Errors
///
/// - `MetainfoError::Fetch` - HTTP download failed or returned a non-success status
/// - `MetainfoError::Io` - Local file unreadable
/// - `MetainfoError::InvalidTorrentFile` - Downloaded or read bytes are not a torrent
pub async fn resolve(
    reference: TorrentRef,
    client: &reqwest::Client,
) -> Result<TorrentSource, MetainfoError> {
    match reference {
        TorrentRef::InfoHash(info_hash) => Ok(TorrentSource::Bare {
            info_hash,
            name: None,
            trackers: Vec::new(),
        }),
        TorrentRef::Magnet {
            info_hash,
            display_name,
            trackers,
        } => Ok(TorrentSource::Bare {
            info_hash,
            name: display_name,
            trackers,
        }),
        TorrentRef::Path(path) => {
            let bytes = tokio::fs::read(&path).await?;
            Ok(TorrentSource::Metainfo(Arc::new(Metainfo::from_torrent_bytes(&bytes)?)))
        }
        TorrentRef::Url(url) => {
            let fetch_error = |reason: String| MetainfoError::Fetch {
                url: url.to_string(),
                reason,
            };
            let response = client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| fetch_error(e.to_string()))?;
            if !response.status().is_success() {
                return Err(fetch_error(format!("HTTP {}", response.status())));
            }
            let bytes = response.bytes().await.map_err(|e| fetch_error(e.to_string()))?;
            tracing::debug!(url = %url, size = bytes.len(), "Fetched torrent file");
            Ok(TorrentSource::Metainfo(Arc::new(Metainfo::from_torrent_bytes(&bytes)?)))
        }
    }
}
