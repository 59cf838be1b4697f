//! Append-only, segmented commit log.
//!
//! The commit log is the durability primitive of transit: the source stage
//! appends every record it reads before fanning it out, and each sink's
//! offset manager appends its committed offsets to a log of its own.
//!
//! # Layout
//!
//! ```text
//! <path>/
//!   00000000000000000000.log   ← offsets 0..N
//!   0000000000000000000N.log   ← offsets N..   (active segment)
//! ```
//!
//! Records are never rewritten in place. A new segment is started once the
//! active one reaches `max_segment_bytes`. Closed segments may be replaced
//! wholesale by a [`Compactor`], which keeps record offsets but leaves gaps.

pub mod compactor;
pub mod entry;
pub mod reader;
pub mod segment;

pub use compactor::{CompactionStats, Compactor, NamespaceCompactor, CLEANED_SUFFIX};
pub use entry::{read_entry, EntryHeader, LogEntry, Mode, HEADER_LEN, LEN_PREFIX};
pub use reader::Reader;
pub use segment::{segment_file_name, Segment, LOG_SUFFIX};

use crate::error::{Result, ResultExt, TransitError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Default segment size limit (100 MiB).
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 100 * 1024 * 1024;

/// Options for opening a [`CommitLog`].
#[derive(Debug, Clone)]
pub struct CommitLogOptions {
    pub path: PathBuf,
    pub max_segment_bytes: u64,
}

impl CommitLogOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
        }
    }

    /// Set the segment size limit. Zero keeps the default.
    pub fn max_segment_bytes(mut self, max: u64) -> Self {
        if max > 0 {
            self.max_segment_bytes = max;
        }
        self
    }
}

/// The segmented log itself.
pub struct CommitLog {
    path: PathBuf,
    max_segment_bytes: u64,
    segments: RwLock<Vec<Arc<Segment>>>,
}

impl CommitLog {
    /// Open the log in `options.path`, creating the directory and an initial
    /// segment if needed.
    pub fn open(options: CommitLogOptions) -> Result<Self> {
        if options.path.as_os_str().is_empty() {
            return Err(TransitError::EmptyPath);
        }
        std::fs::create_dir_all(&options.path)
            .with_context(|| format!("Failed to create {}", options.path.display()))?;

        let mut bases = Vec::new();
        for entry in std::fs::read_dir(&options.path)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(CLEANED_SUFFIX) {
                tracing::warn!(file = name, "Removing interrupted compaction");
                std::fs::remove_file(options.path.join(name))?;
                continue;
            }
            if let Some(stem) = name.strip_suffix(LOG_SUFFIX) {
                match stem.parse::<u64>() {
                    Ok(base) => bases.push(base),
                    Err(_) => tracing::warn!(file = name, "Ignoring unrecognised log file"),
                }
            }
        }
        bases.sort_unstable();

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for base in bases {
            segments.push(Arc::new(Segment::open(
                &options.path,
                base,
                options.max_segment_bytes,
            )?));
        }
        if segments.is_empty() {
            segments.push(Arc::new(Segment::open(
                &options.path,
                0,
                options.max_segment_bytes,
            )?));
        }

        tracing::debug!(
            path = %options.path.display(),
            segments = segments.len(),
            "Commit log opened"
        );

        Ok(Self {
            path: options.path,
            max_segment_bytes: options.max_segment_bytes,
            segments: RwLock::new(segments),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `entry` to the active segment and return the offset assigned
    /// to it.
    pub fn append(&self, entry: &LogEntry) -> Result<u64> {
        if self.active_segment().is_full() {
            self.split()?;
        }
        let active = self.active_segment();
        let offset = active.next_offset();
        active.write(&entry.encode(offset)?)?;
        Ok(offset)
    }

    /// Offset the next appended record will receive.
    pub fn newest_offset(&self) -> u64 {
        self.active_segment().next_offset()
    }

    /// Base offset of the oldest segment on disk.
    pub fn oldest_offset(&self) -> u64 {
        self.read_segments()[0].base_offset()
    }

    pub fn is_empty(&self) -> bool {
        self.newest_offset() == self.oldest_offset()
    }

    /// Snapshot of the current segment list, oldest first.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.read_segments().clone()
    }

    /// A reader positioned at the record carrying `offset`, or at the next
    /// record on disk if compaction removed it.
    pub fn reader(&self, offset: u64) -> Result<Reader<'_>> {
        let segments = self.segments();
        let idx = segments
            .iter()
            .rposition(|s| s.base_offset() <= offset)
            .ok_or(TransitError::SegmentNotFound)?;
        tracing::debug!(offset, segment = idx, "Searching segment for offset");
        match segments[idx].find_offset_position(offset) {
            Ok(position) => Ok(Reader::new(self, idx, position)),
            Err(TransitError::OffsetNotFound(_)) if idx + 1 < segments.len() => {
                Ok(Reader::new(self, idx + 1, 0))
            }
            Err(e) => Err(e),
        }
    }

    /// A reader positioned at the first record on disk.
    pub fn reader_from_start(&self) -> Reader<'_> {
        Reader::new(self, 0, 0)
    }

    /// Flush every segment to stable storage.
    pub fn sync(&self) -> Result<()> {
        for segment in self.read_segments().iter() {
            segment.sync()?;
        }
        Ok(())
    }

    /// Remove the log directory and everything in it.
    pub fn delete_all(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_dir_all(&path)?;
        Ok(())
    }

    /// Swap the closed segment starting at `base_offset` for the rewritten
    /// file at `cleaned`.
    pub(crate) fn replace_segment(&self, base_offset: u64, cleaned: &Path) -> Result<()> {
        let mut segments = self
            .segments
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let idx = segments
            .iter()
            .position(|s| s.base_offset() == base_offset)
            .ok_or(TransitError::SegmentNotFound)?;
        if idx + 1 == segments.len() {
            return Err(TransitError::Config(
                "the active segment cannot be replaced".to_string(),
            ));
        }
        std::fs::rename(cleaned, segments[idx].path())?;
        segments[idx] = Arc::new(Segment::open(&self.path, base_offset, self.max_segment_bytes)?);
        Ok(())
    }

    fn active_segment(&self) -> Arc<Segment> {
        let segments = self.read_segments();
        Arc::clone(&segments[segments.len() - 1])
    }

    fn split(&self) -> Result<()> {
        let base = self.newest_offset();
        let segment = Arc::new(Segment::open(&self.path, base, self.max_segment_bytes)?);
        tracing::info!(segment = %segment.path().display(), "New segment created");
        self.segments
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(segment);
        Ok(())
    }

    fn read_segments(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Segment>>> {
        self.segments
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
