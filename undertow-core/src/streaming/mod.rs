//! Playback-side view of torrents: window prioritization and readers.

pub mod buffer;
pub mod reader;

pub use buffer::{BufferController, ReaderId, ReaderView};
pub use reader::{MAX_CHUNK, ReadError, Reader};
