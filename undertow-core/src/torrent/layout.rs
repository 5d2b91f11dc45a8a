//! Logical file layout of a torrent: cumulative offsets and piece ranges.

use std::path::PathBuf;

use serde::Serialize;

use super::PieceRange;

/// One file inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub index: usize,
    /// Path components as they appear in the metainfo
    pub path: Vec<String>,
    pub length: u64,
    /// Byte offset of the file's first byte within the torrent
    pub offset: u64,
}

impl FileEntry {
    /// Builds entries with cumulative offsets from `(path, length)` pairs.
    pub fn layout(files: impl IntoIterator<Item = (Vec<String>, u64)>) -> Vec<FileEntry> {
        let mut offset = 0u64;
        files
            .into_iter()
            .enumerate()
            .map(|(index, (path, length))| {
                let entry = FileEntry {
                    index,
                    path,
                    length,
                    offset,
                };
                offset += length;
                entry
            })
            .collect()
    }

    /// Path relative to the torrent's payload directory.
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }

    pub fn display_path(&self) -> String {
        self.path.join("/")
    }

    pub fn file_name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Lowercase extension without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        let dot = name.rfind('.')?;
        Some(name[dot + 1..].to_ascii_lowercase())
    }

    /// Pieces holding at least one byte of this file; empty for zero-length files.
    pub fn pieces(&self, piece_length: u32) -> PieceRange {
        if self.length == 0 || piece_length == 0 {
            return PieceRange::empty();
        }
        let piece_length = u64::from(piece_length);
        let first = self.offset / piece_length;
        let last = (self.offset + self.length - 1) / piece_length;
        PieceRange::new(first as u32, last as u32 + 1)
    }

    /// Piece holding the file byte at `position`.
    pub fn piece_at(&self, position: u64, piece_length: u32) -> u32 {
        ((self.offset + position) / u64::from(piece_length)) as u32
    }
}

/// A contiguous slice of one file covered by a torrent-level byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    /// Offset within the file
    pub file_offset: u64,
    pub length: u64,
}

/// Splits the torrent-level byte range `[offset, offset + length)` by file.
///
/// Zero-length files never produce spans.
pub fn spans(files: &[FileEntry], offset: u64, length: u64) -> Vec<FileSpan> {
    let end = offset + length;
    files
        .iter()
        .filter(|file| file.length > 0)
        .filter_map(|file| {
            let file_end = file.offset + file.length;
            let start = offset.max(file.offset);
            let stop = end.min(file_end);
            (start < stop).then(|| FileSpan {
                file_index: file.index,
                file_offset: start - file.offset,
                length: stop - start,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample_files() -> Vec<FileEntry> {
        FileEntry::layout(vec![
            (vec!["a.nfo".to_string()], 100),
            (vec!["empty".to_string()], 0),
            (vec!["Show".to_string(), "b.mkv".to_string()], 1000),
            (vec!["c.srt".to_string()], 50),
        ])
    }

    #[test]
    fn test_layout_offsets() {
        let files = sample_files();
        assert_eq!(files[0].offset, 0);
        assert_eq!(files[1].offset, 100);
        assert_eq!(files[2].offset, 100);
        assert_eq!(files[3].offset, 1100);
        assert_eq!(files[2].relative_path(), PathBuf::from("Show/b.mkv"));
        assert_eq!(files[2].extension().as_deref(), Some("mkv"));
    }

    #[test]
    fn test_piece_ranges() {
        let files = sample_files();
        assert_eq!(files[0].pieces(64), PieceRange::new(0, 2));
        assert!(files[1].pieces(64).is_empty());
        // bytes 100..1100 -> pieces 1..=17
        assert_eq!(files[2].pieces(64), PieceRange::new(1, 18));
        assert_eq!(files[2].piece_at(0, 64), 1);
        assert_eq!(files[2].piece_at(999, 64), 17);
    }

    #[test]
    fn test_spans_cross_file_boundary() {
        let files = sample_files();
        let result = spans(&files, 64, 64);
        assert_eq!(
            result,
            vec![
                FileSpan {
                    file_index: 0,
                    file_offset: 64,
                    length: 36
                },
                FileSpan {
                    file_index: 2,
                    file_offset: 0,
                    length: 28
                },
            ]
        );
    }

    proptest! {
        #[test]
        fn test_spans_cover_requested_length(offset in 0u64..1150, length in 0u64..200) {
            let files = sample_files();
            let total: u64 = files.iter().map(|f| f.length).sum();
            let length = length.min(total - offset);
            let covered: u64 = spans(&files, offset, length).iter().map(|s| s.length).sum();
            prop_assert_eq!(covered, length);
        }
    }
}
