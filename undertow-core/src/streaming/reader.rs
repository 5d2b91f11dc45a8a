//! Byte-stream view of one file inside a torrent.
//!
//! A [`Reader`] blocks until the piece under its offset is verified, pinning
//! that piece so the store cannot evict it mid-copy. Seeking never blocks: it
//! only moves the reader's head window and returns. Every wait races the
//! reader's cancellation token, so a dropped HTTP client never leaves a read
//! parked in the store.

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use super::buffer::ReaderId;
use crate::error::ErrorKind;
use crate::storage::{PieceStore, StoreError};
use crate::torrent::{FileEntry, InfoHash, Torrent};

/// Largest chunk handed out by [`Reader::read_chunk`] per call.
pub const MAX_CHUNK: usize = 64 * 1024;

/// Errors that can occur while reading from a torrent file.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Cancellation token fired while waiting for data
    #[error("Read cancelled")]
    Cancelled,

    /// Torrent was removed while the reader was open
    #[error("Torrent {info_hash} was torn down")]
    TornDown { info_hash: InfoHash },

    /// Torrent entered the error state
    #[error("Torrent {info_hash} failed: {detail}")]
    Failed {
        info_hash: InfoHash,
        kind: ErrorKind,
        detail: String,
    },

    /// Seek target before the start of the file
    #[error("Invalid seek to {offset}")]
    InvalidSeek { offset: i128 },

    #[error(transparent)]
    Store(StoreError),
}

impl ReadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReadError::Cancelled => ErrorKind::ReaderCancelled,
            ReadError::TornDown { .. } => ErrorKind::Shutdown,
            ReadError::Failed { kind, .. } => *kind,
            ReadError::InvalidSeek { .. } => ErrorKind::InvalidRange,
            ReadError::Store(e) => e.kind(),
        }
    }
}

/// Sequential reader over one file of a torrent.
#[derive(Debug)]
pub struct Reader {
    id: ReaderId,
    torrent: Arc<Torrent>,
    store: Arc<PieceStore>,
    file: FileEntry,
    offset: u64,
    gate_passed: bool,
    cancel: CancellationToken,
}

impl Reader {
    /// Called by [`Torrent::attach_reader`] after registering `id` with the
    /// torrent's buffer controller.
    pub(crate) fn new(
        id: ReaderId,
        torrent: Arc<Torrent>,
        store: Arc<PieceStore>,
        file: FileEntry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            torrent,
            store,
            file,
            offset: 0,
            gate_passed: false,
            cancel,
        }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.torrent.info_hash()
    }

    pub fn file(&self) -> &FileEntry {
        &self.file
    }

    /// Total length of the file in bytes.
    pub fn len(&self) -> u64 {
        self.file.length
    }

    pub fn is_empty(&self) -> bool {
        self.file.length == 0
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Token that aborts any pending read of this reader.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Moves the read offset and the reader's head window. Never waits for
    /// data; offsets past the end are allowed and read as end of file.
    ///
    /// # Errors
    ///
    /// - `ReadError::InvalidSeek` - Target before the start of the file
    pub fn seek(&mut self, position: SeekFrom) -> Result<u64, ReadError> {
        let target = match position {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.offset) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.file.length) + i128::from(delta),
        };
        if target < 0 {
            return Err(ReadError::InvalidSeek { offset: target });
        }
        let target = u64::try_from(target).unwrap_or(u64::MAX);
        self.offset = target;
        self.torrent
            .reader_moved(self.id, target.min(self.file.length), true);
        Ok(target)
    }

    /// Reads into `buf`, returning the number of bytes copied. Zero means end
    /// of file.
    ///
    /// # Errors
    ///
    /// - `ReadError::Cancelled` - Token fired while waiting
    /// - `ReadError::TornDown` - Torrent removed while waiting
    /// - `ReadError::Failed` - Torrent is in the error state
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let chunk = self.read_chunk(buf.len()).await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Reads at most `max` bytes without crossing a piece boundary. An empty
    /// chunk means end of file.
    ///
    /// # Errors
    ///
    /// Same as [`Reader::read`].
    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes, ReadError> {
        if self.offset >= self.file.length || max == 0 {
            return Ok(Bytes::new());
        }
        self.check_torrent()?;
        if !self.gate_passed {
            self.wait_for_buffer().await?;
            self.gate_passed = true;
        }

        let piece_length = u64::from(self.store.piece_length());
        let absolute = self.file.offset + self.offset;
        let piece = (absolute / piece_length) as u32;
        let within = (absolute % piece_length) as u32;
        let available = u64::from(self.store.piece_size(piece) - within)
            .min(self.file.length - self.offset)
            .min(max as u64) as u32;

        let _pin = self.store.pin(piece);
        let mut states = self.torrent.subscribe_state();
        let data = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ReadError::Cancelled),
                _ = states.changed() => {
                    self.check_torrent()?;
                    continue;
                }
                waited = self.store.await_piece(piece) => waited.map_err(|e| self.store_error(e))?,
            }
            match self.store.fetch_block(piece, within, available).await {
                Ok(data) => break data,
                Err(StoreError::NotPresent { .. }) => continue,
                Err(e) => return Err(self.store_error(e)),
            }
        };

        self.offset += data.len() as u64;
        self.torrent.reader_moved(self.id, self.offset, false);
        Ok(data)
    }

    /// Turns the reader into a stream of chunks covering at most `limit`
    /// bytes from the current offset.
    pub fn into_stream(self, limit: u64) -> impl Stream<Item = Result<Bytes, ReadError>> + Send + 'static {
        futures::stream::unfold((self, limit), |(mut reader, remaining)| async move {
            if remaining == 0 {
                return None;
            }
            let max = remaining.min(MAX_CHUNK as u64) as usize;
            match reader.read_chunk(max).await {
                Ok(chunk) if chunk.is_empty() => None,
                Ok(chunk) => {
                    let remaining = remaining - chunk.len() as u64;
                    Some((Ok(chunk), (reader, remaining)))
                }
                Err(e) => Some((Err(e), (reader, 0))),
            }
        })
    }

    /// Detaches from the torrent. Dropping the reader does the same.
    pub fn close(self) {}

    /// Blocks the first read until the buffering gate opens.
    async fn wait_for_buffer(&self) -> Result<(), ReadError> {
        let mut completions = self.store.subscribe();
        let mut states = self.torrent.subscribe_state();
        loop {
            if self.store.is_torn_down() {
                return Err(ReadError::TornDown {
                    info_hash: self.info_hash(),
                });
            }
            self.check_torrent()?;
            if self.torrent.is_buffered_for(self.id) {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ReadError::Cancelled),
                _ = states.changed() => {}
                changed = completions.changed() => {
                    if changed.is_err() {
                        return Err(ReadError::TornDown { info_hash: self.info_hash() });
                    }
                }
            }
        }
    }

    fn check_torrent(&self) -> Result<(), ReadError> {
        match self.torrent.failure() {
            Some((kind, detail)) => Err(ReadError::Failed {
                info_hash: self.info_hash(),
                kind,
                detail,
            }),
            None => Ok(()),
        }
    }

    fn store_error(&self, error: StoreError) -> ReadError {
        match error {
            StoreError::TornDown => ReadError::TornDown {
                info_hash: self.info_hash(),
            },
            other => ReadError::Store(other),
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.torrent.detach_reader(self.id);
    }
}
