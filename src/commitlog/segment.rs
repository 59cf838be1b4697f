//! Commit log segments.
//!
//! A segment is a single append-only file holding a contiguous run of
//! records. Its name is the zero-padded offset of its first record, so a
//! directory listing sorted by name is also sorted by offset.

use crate::commitlog::entry::{read_full, EntryHeader, HEADER_LEN};
use crate::error::{Result, TransitError};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File suffix for active segments.
pub const LOG_SUFFIX: &str = ".log";

/// File name of the segment whose first record has `base_offset`.
pub fn segment_file_name(base_offset: u64) -> String {
    format!("{:020}{}", base_offset, LOG_SUFFIX)
}

struct SegmentInner {
    file: File,
    next_offset: u64,
    position: u64,
}

/// Handles reading and writing one segment file.
pub struct Segment {
    path: PathBuf,
    base_offset: u64,
    max_bytes: u64,
    inner: Mutex<SegmentInner>,
}

impl Segment {
    /// Open (creating if needed) the segment starting at `base_offset` and
    /// scan it to recover the next offset and write position.
    ///
    /// A partially written trailing record is cut off.
    pub fn open(dir: &Path, base_offset: u64, max_bytes: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(base_offset));
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let segment = Self {
            path,
            base_offset,
            max_bytes,
            inner: Mutex::new(SegmentInner {
                file,
                next_offset: base_offset,
                position: 0,
            }),
        };
        segment.recover()?;
        Ok(segment)
    }

    fn recover(&self) -> Result<()> {
        let mut inner = self.lock();
        let file_len = inner.file.metadata()?.len();
        let mut position = 0u64;
        let mut next_offset = self.base_offset;

        loop {
            let mut header_buf = [0u8; HEADER_LEN];
            if read_at(&mut inner.file, &mut header_buf, position)? < HEADER_LEN {
                break;
            }
            let header = EntryHeader::decode(&header_buf);
            if position + header.record_len() > file_len {
                break;
            }
            next_offset = header.offset + 1;
            position += header.record_len();
        }

        if position < file_len {
            tracing::warn!(
                segment = %self.path.display(),
                valid_bytes = position,
                file_bytes = file_len,
                "Truncating partial record at end of segment"
            );
            inner.file.set_len(position)?;
        }

        inner.next_offset = next_offset;
        inner.position = position;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SegmentInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Offset the next appended record will carry.
    pub fn next_offset(&self) -> u64 {
        self.lock().next_offset
    }

    /// Number of bytes of complete records in the segment.
    pub fn position(&self) -> u64 {
        self.lock().position
    }

    pub fn is_full(&self) -> bool {
        self.lock().position >= self.max_bytes
    }

    /// Append one encoded record.
    pub fn write(&self, record: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        inner.append_with(|file| file.write_all(record))?;
        inner.next_offset += 1;
        inner.position += record.len() as u64;
        Ok(record.len())
    }

    /// Read into `buf` starting at absolute byte `position`. Returns fewer
    /// bytes than requested only at end of the segment.
    pub fn read_at(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
        let mut inner = self.lock();
        read_at(&mut inner.file, buf, position)
    }

    /// Byte position of the first record carrying `offset` or later.
    pub fn find_offset_position(&self, offset: u64) -> Result<u64> {
        let mut inner = self.lock();
        let mut position = 0u64;
        loop {
            let mut header_buf = [0u8; HEADER_LEN];
            if read_at(&mut inner.file, &mut header_buf, position)? < HEADER_LEN {
                return Err(TransitError::OffsetNotFound(offset));
            }
            let header = EntryHeader::decode(&header_buf);
            if header.offset >= offset {
                tracing::debug!(position, offset, "Found offset position");
                return Ok(position);
            }
            position += header.record_len();
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.lock().file.sync_data()?;
        Ok(())
    }
}

impl SegmentInner {
    /// Run `write` against the file. If it fails, the file is cut back to the
    /// last complete record so the next append does not land after torn bytes.
    fn append_with<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let Err(e) = write(&mut self.file) else {
            return Ok(());
        };
        if let Err(truncate) = self.file.set_len(self.position) {
            tracing::error!(
                position = self.position,
                "Failed to roll back partial write: {}",
                truncate
            );
        }
        Err(e.into())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("base_offset", &self.base_offset)
            .finish()
    }
}

fn read_at(file: &mut File, buf: &mut [u8], position: u64) -> io::Result<usize> {
    file.seek(SeekFrom::Start(position))?;
    read_full(file, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::entry::{LogEntry, Mode};
    use crate::message::Op;

    fn record(offset: u64) -> Vec<u8> {
        LogEntry {
            key: b"db.c".to_vec(),
            value: b"{\"a\":1}".to_vec(),
            timestamp: 10,
            mode: Mode::Copy,
            op: Op::Insert,
        }
        .encode(offset)
        .unwrap()
        .to_vec()
    }

    #[test]
    fn test_segment_file_name() {
        assert_eq!(segment_file_name(42), "00000000000000000042.log");
    }

    #[test]
    fn test_write_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let len = record(0).len() as u64;
        {
            let segment = Segment::open(dir.path(), 5, 1024).unwrap();
            assert_eq!(segment.next_offset(), 5);
            segment.write(&record(5)).unwrap();
            segment.write(&record(6)).unwrap();
            assert_eq!(segment.next_offset(), 7);
        }
        let segment = Segment::open(dir.path(), 5, 1024).unwrap();
        assert_eq!(segment.next_offset(), 7);
        assert_eq!(segment.position(), 2 * len);
        assert_eq!(segment.find_offset_position(6).unwrap(), len);
        assert!(matches!(
            segment.find_offset_position(9),
            Err(TransitError::OffsetNotFound(9))
        ));
    }

    #[test]
    fn test_truncates_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let full = record(0);
        {
            let segment = Segment::open(dir.path(), 0, 1024).unwrap();
            segment.write(&full).unwrap();
            segment.write(&full[..full.len() / 2]).unwrap();
        }
        let segment = Segment::open(dir.path(), 0, 1024).unwrap();
        assert_eq!(segment.next_offset(), 1);
        assert_eq!(segment.position(), full.len() as u64);
        let on_disk = std::fs::metadata(segment.path()).unwrap().len();
        assert_eq!(on_disk, full.len() as u64);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Segment::open(dir.path(), 0, 1024).unwrap();
        let first = record(0);
        segment.write(&first).unwrap();

        let torn = record(1);
        let result = segment.lock().append_with(|file| {
            file.write_all(&torn[..torn.len() / 2])?;
            Err(io::Error::other("disk full"))
        });
        assert!(matches!(result, Err(TransitError::Io(_))));
        assert_eq!(segment.next_offset(), 1);
        let on_disk = std::fs::metadata(segment.path()).unwrap().len();
        assert_eq!(on_disk, first.len() as u64);

        segment.write(&torn).unwrap();
        drop(segment);
        let segment = Segment::open(dir.path(), 0, 1024).unwrap();
        assert_eq!(segment.next_offset(), 2);
        assert_eq!(segment.position(), (first.len() + torn.len()) as u64);
    }

    #[test]
    fn test_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Segment::open(dir.path(), 0, 10).unwrap();
        assert!(!segment.is_full());
        segment.write(&record(0)).unwrap();
        assert!(segment.is_full());
    }
}
