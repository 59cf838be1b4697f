//! Sequential reader over a commit log.

use crate::commitlog::entry::{read_entry, LogEntry};
use crate::commitlog::{CommitLog, Segment};
use crate::error::Result;
use std::io::{self, Read};
use std::sync::Arc;

/// Reads a commit log front to back, crossing segment boundaries.
///
/// The segment list is re-fetched whenever the current segment runs out, so
/// a reader created while the log is being appended to also sees segments
/// split off later. The current segment is held on to, which keeps byte
/// positions valid if compaction swaps its file out.
pub struct Reader<'a> {
    log: &'a CommitLog,
    idx: usize,
    segment: Option<Arc<Segment>>,
    position: u64,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(log: &'a CommitLog, idx: usize, position: u64) -> Self {
        Self {
            log,
            idx,
            segment: None,
            position,
        }
    }

    /// Decode the next record. `Ok(None)` means end of data.
    pub fn next_entry(&mut self) -> Result<Option<(u64, LogEntry)>> {
        read_entry(self)
    }
}

impl Read for Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let segment = match &self.segment {
                Some(segment) => Arc::clone(segment),
                None => match self.log.segments().get(self.idx) {
                    Some(segment) => {
                        self.segment = Some(Arc::clone(segment));
                        Arc::clone(segment)
                    }
                    None => return Ok(0),
                },
            };
            let n = segment.read_at(buf, self.position)?;
            if n > 0 {
                self.position += n as u64;
                return Ok(n);
            }
            if self.idx + 1 >= self.log.segments().len() {
                return Ok(0);
            }
            self.idx += 1;
            self.segment = None;
            self.position = 0;
        }
    }
}
