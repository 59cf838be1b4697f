//! Namespace compaction of closed segments.
//!
//! Segments that have been rolled over and whose records every consumer has
//! committed are rewritten to hold only the newest record of each key (the
//! source namespace). Offsets are preserved, so a compacted segment has gaps
//! and readers skip forward to the next record on disk.

use crate::commitlog::entry::{read_entry, LogEntry};
use crate::commitlog::{CommitLog, Segment};
use crate::error::Result;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};

/// Suffix of a segment being rewritten. Leftovers are removed on open.
pub const CLEANED_SUFFIX: &str = ".cleaned";

/// Outcome of one compaction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Segments rewritten.
    pub segments: usize,
    /// Records dropped across those segments.
    pub removed: u64,
}

/// Shrinks the closed segments of a commit log.
pub trait Compactor: Send + Sync {
    /// Compact every closed segment of `log` whose records all carry an
    /// offset below `below`.
    fn compact(&self, log: &CommitLog, below: u64) -> Result<CompactionStats>;
}

/// Keeps the newest record per namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamespaceCompactor;

impl Compactor for NamespaceCompactor {
    fn compact(&self, log: &CommitLog, below: u64) -> Result<CompactionStats> {
        let segments = log.segments();
        let closed = &segments[..segments.len().saturating_sub(1)];
        tracing::info!(segments = closed.len(), below, "Starting compaction");

        let mut stats = CompactionStats::default();
        for segment in closed {
            let Some((total, kept)) = newest_per_key(segment, below)? else {
                tracing::info!(
                    segment = %segment.path().display(),
                    below,
                    "Segment holds unread offsets, leaving it"
                );
                break;
            };
            if kept.len() as u64 == total {
                continue;
            }

            let cleaned = log
                .path()
                .join(format!("{:020}{}", segment.base_offset(), CLEANED_SUFFIX));
            let mut file = File::create(&cleaned)?;
            for (offset, entry) in &kept {
                file.write_all(&entry.encode(*offset)?)?;
            }
            file.sync_all()?;
            drop(file);
            log.replace_segment(segment.base_offset(), &cleaned)?;

            stats.segments += 1;
            stats.removed += total - kept.len() as u64;
            tracing::info!(
                segment = %segment.path().display(),
                kept = kept.len(),
                removed = total - kept.len() as u64,
                "Segment compacted"
            );
        }
        tracing::info!(segments = stats.segments, removed = stats.removed, "Compaction complete");
        Ok(stats)
    }
}

/// Record count of `segment` and its newest record per key in offset order,
/// or `None` if any record sits at or past `below`.
fn newest_per_key(segment: &Segment, below: u64) -> Result<Option<(u64, Vec<(u64, LogEntry)>)>> {
    let mut reader = SegmentReader {
        segment,
        position: 0,
    };
    let mut newest: HashMap<Vec<u8>, (u64, LogEntry)> = HashMap::new();
    let mut total = 0u64;
    while let Some((offset, entry)) = read_entry(&mut reader)? {
        if offset >= below {
            return Ok(None);
        }
        total += 1;
        newest.insert(entry.key.clone(), (offset, entry));
    }
    let mut kept: Vec<_> = newest.into_values().collect();
    kept.sort_unstable_by_key(|(offset, _)| *offset);
    Ok(Some((total, kept)))
}

struct SegmentReader<'a> {
    segment: &'a Segment,
    position: u64,
}

impl Read for SegmentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.segment.read_at(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}
