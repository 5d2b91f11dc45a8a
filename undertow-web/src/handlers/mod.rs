//! HTTP request handlers organized by functionality

pub mod api;
pub mod files;
pub mod range;

// Re-export handler functions
pub use api::{
    AddTorrentQuery, add_torrent, delete_torrent, info, list_torrents, pause_torrent, reload, resume_torrent,
    shutdown,
};
pub use files::stream_file;
pub use range::{ByteRange, RangeRequest, parse_range};
