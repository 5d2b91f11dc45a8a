//! Persisted record describing a torrent the service knows about.

use serde::{Deserialize, Serialize};

use super::InfoHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentItemState {
    Active,
    Removed,
}

impl TorrentItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            TorrentItemState::Active => "active",
            TorrentItemState::Removed => "removed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(TorrentItemState::Active),
            "removed" => Some(TorrentItemState::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Show,
    Episode,
    #[default]
    Unknown,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Show => "show",
            MediaType::Episode => "episode",
            MediaType::Unknown => "unknown",
        }
    }

    /// Lenient parse; anything unrecognized is `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "movie" => MediaType::Movie,
            "show" | "tvshow" => MediaType::Show,
            "episode" => MediaType::Episode,
            _ => MediaType::Unknown,
        }
    }

    pub fn is_series(self) -> bool {
        matches!(self, MediaType::Show | MediaType::Episode)
    }
}

/// Caller-supplied context linking a torrent to library media.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaContext {
    pub media_type: MediaType,
    /// 0 when unassigned
    pub media_id: i64,
    pub show_id: Option<i64>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub query: Option<String>,
}

/// The persisted `TorrentItem`. The infohash is the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentItem {
    pub info_hash: InfoHash,
    pub state: TorrentItemState,
    pub media_id: i64,
    pub media_type: MediaType,
    /// Selected file paths, in selection order
    pub files: Vec<String>,
    pub context: MediaContext,
}

impl TorrentItem {
    pub fn new(info_hash: InfoHash, context: MediaContext) -> Self {
        Self {
            info_hash,
            state: TorrentItemState::Active,
            media_id: context.media_id,
            media_type: context.media_type,
            files: Vec::new(),
            context,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TorrentItemState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_item_json_roundtrip() {
        let item = TorrentItem {
            info_hash: InfoHash::new([7; 20]),
            state: TorrentItemState::Removed,
            media_id: 1399,
            media_type: MediaType::Episode,
            files: vec!["Show/S01E02.mkv".to_string(), "Show/S01E02.srt".to_string()],
            context: MediaContext {
                media_type: MediaType::Episode,
                media_id: 1399,
                show_id: Some(1399),
                season: Some(1),
                episode: Some(2),
                query: Some("show s01e02".to_string()),
            },
        };

        let json = serde_json::to_string(&item).unwrap();
        let back: TorrentItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_media_type_parse_is_lenient() {
        assert_eq!(MediaType::parse("Movie"), MediaType::Movie);
        assert_eq!(MediaType::parse("tvshow"), MediaType::Show);
        assert_eq!(MediaType::parse("trailer"), MediaType::Unknown);
        assert!(MediaType::Episode.is_series());
    }

    #[test]
    fn test_state_codes() {
        for state in [TorrentItemState::Active, TorrentItemState::Removed] {
            assert_eq!(TorrentItemState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TorrentItemState::parse("gone"), None);
    }
}
