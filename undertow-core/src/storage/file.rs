//! Sparse on-disk payload files for file-backed torrents.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::torrent::layout::{self, FileEntry};

#[cfg(target_os = "linux")]
mod hole {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    const FALLOC_FL_KEEP_SIZE: i32 = 0x01;
    const FALLOC_FL_PUNCH_HOLE: i32 = 0x02;

    unsafe extern "C" {
        fn fallocate(fd: i32, mode: i32, offset: i64, len: i64) -> i32;
    }

    /// Deallocates `[offset, offset + length)` while keeping the file size.
    pub fn punch(file: &File, offset: u64, length: u64) -> bool {
        // SAFETY: the descriptor stays open for the duration of the call.
        let result = unsafe {
            fallocate(
                file.as_raw_fd(),
                FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE,
                offset as i64,
                length as i64,
            )
        };
        result == 0
    }
}

#[cfg(not(target_os = "linux"))]
mod hole {
    use std::fs::File;

    pub fn punch(_file: &File, _offset: u64, _length: u64) -> bool {
        false
    }
}

#[derive(Debug)]
struct PayloadFile {
    path: PathBuf,
    handle: Option<File>,
}

/// One preallocated sparse file per torrent entry, addressed by torrent offset.
#[derive(Debug)]
pub(crate) struct SparseFiles {
    root: PathBuf,
    entries: Vec<FileEntry>,
    files: Vec<PayloadFile>,
}

impl SparseFiles {
    /// Creates (or reopens) every payload file under `root`, extending each to
    /// its full length without writing data.
    ///
    /// Entries whose path is not a plain relative path are refused before
    /// anything is created.
    pub fn open(root: &Path, entries: &[FileEntry]) -> io::Result<Self> {
        if let Some(entry) = entries.iter().find(|entry| !stays_inside(&entry.relative_path())) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload path escapes its root: {}", entry.display_path()),
            ));
        }
        fs::create_dir_all(root)?;
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = root.join(entry.relative_path());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            if handle.metadata()?.len() != entry.length {
                handle.set_len(entry.length)?;
            }
            tracing::trace!(path = %path.display(), length = entry.length, "Sparse allocated");
            files.push(PayloadFile {
                path,
                handle: Some(handle),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
            entries: entries.to_vec(),
            files,
        })
    }

    fn handle(&mut self, index: usize) -> io::Result<&mut File> {
        self.files
            .get_mut(index)
            .and_then(|file| file.handle.as_mut())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "payload file closed"))
    }

    /// Writes `data` at torrent offset `offset`, splitting across files.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let spans = layout::spans(&self.entries, offset, data.len() as u64);
        let mut consumed = 0usize;
        for span in spans {
            let length = span.length as usize;
            let handle = self.handle(span.file_index)?;
            handle.seek(SeekFrom::Start(span.file_offset))?;
            handle.write_all(&data[consumed..consumed + length])?;
            consumed += length;
        }
        Ok(())
    }

    /// Reads `length` bytes at torrent offset `offset`.
    pub fn read_at(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let spans = layout::spans(&self.entries, offset, length as u64);
        let mut out = vec![0u8; length];
        let mut filled = 0usize;
        for span in spans {
            let span_length = span.length as usize;
            let handle = self.handle(span.file_index)?;
            handle.seek(SeekFrom::Start(span.file_offset))?;
            handle.read_exact(&mut out[filled..filled + span_length])?;
            filled += span_length;
        }
        Ok(out)
    }

    /// Releases disk blocks backing the torrent range. Returns false when the
    /// platform cannot deallocate.
    pub fn punch(&mut self, offset: u64, length: u64) -> bool {
        let spans = layout::spans(&self.entries, offset, length);
        let mut punched = true;
        for span in spans {
            match self.files[span.file_index].handle.as_ref() {
                Some(handle) => punched &= hole::punch(handle, span.file_offset, span.length),
                None => punched = false,
            }
        }
        punched
    }

    pub fn flush(&mut self) -> io::Result<()> {
        for file in &mut self.files {
            if let Some(handle) = file.handle.as_mut() {
                handle.flush()?;
            }
        }
        Ok(())
    }

    /// Closes handles and, when `delete` is set, removes the payload tree.
    pub fn close(&mut self, delete: bool) -> io::Result<()> {
        for file in &mut self.files {
            file.handle = None;
        }
        if delete {
            for file in &self.files {
                match fs::remove_file(&file.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            match fs::remove_dir_all(&self.root) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn stays_inside(path: &Path) -> bool {
    path.components().next().is_some()
        && path.components().all(|component| matches!(component, Component::Normal(_)))
}

/// Reads the resume bitfield; missing or unreadable files yield nothing.
pub(crate) fn load_resume(path: &Path, piece_count: u32) -> Vec<u32> {
    let Ok(bytes) = fs::read(path) else {
        return Vec::new();
    };
    (0..piece_count)
        .filter(|piece| {
            let byte = (*piece / 8) as usize;
            let bit = 7 - (piece % 8);
            bytes.get(byte).is_some_and(|b| b & (1 << bit) != 0)
        })
        .collect()
}

/// Writes the resume bitfield atomically (temp file plus rename).
pub(crate) fn save_resume(path: &Path, present: &[bool]) -> io::Result<()> {
    let mut bytes = vec![0u8; present.len().div_ceil(8)];
    for (piece, _) in present.iter().enumerate().filter(|(_, has)| **has) {
        bytes[piece / 8] |= 1 << (7 - (piece % 8));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("resume.tmp");
    fs::write(&temp, &bytes)?;
    fs::rename(&temp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<FileEntry> {
        FileEntry::layout(vec![
            (vec!["pack".to_string(), "a.bin".to_string()], 10),
            (vec!["pack".to_string(), "b.bin".to_string()], 20),
        ])
    }

    #[test]
    fn test_files_are_preallocated_to_full_length() {
        let dir = tempfile::tempdir().unwrap();
        let _files = SparseFiles::open(dir.path(), &entries()).unwrap();
        let a = fs::metadata(dir.path().join("pack/a.bin")).unwrap();
        let b = fs::metadata(dir.path().join("pack/b.bin")).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 20);
    }

    #[test]
    fn test_write_and_read_across_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = SparseFiles::open(dir.path(), &entries()).unwrap();
        let data: Vec<u8> = (0..12).collect();
        files.write_at(4, &data).unwrap();
        assert_eq!(files.read_at(4, 12).unwrap(), data);
        let a = fs::read(dir.path().join("pack/a.bin")).unwrap();
        assert_eq!(&a[4..], &data[..6]);
    }

    #[test]
    fn test_close_with_delete_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("payload");
        let mut files = SparseFiles::open(&root, &entries()).unwrap();
        files.close(true).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_open_refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("payload");
        for path in [
            vec!["..".to_string(), "escaped.bin".to_string()],
            vec!["/tmp".to_string(), "undertow-escaped.bin".to_string()],
            Vec::new(),
        ] {
            let entries = FileEntry::layout(vec![(path.clone(), 10)]);
            let err = SparseFiles::open(&root, &entries).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{path:?}");
        }
        assert!(!root.exists());
        assert!(!dir.path().join("escaped.bin").exists());
        assert!(!Path::new("/tmp/undertow-escaped.bin").exists());
    }

    #[test]
    fn test_resume_bitfield_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.resume");
        let mut present = vec![false; 11];
        present[0] = true;
        present[7] = true;
        present[10] = true;
        save_resume(&path, &present).unwrap();
        assert_eq!(load_resume(&path, 11), vec![0, 7, 10]);
        assert!(load_resume(&dir.path().join("missing"), 11).is_empty());
    }
}
