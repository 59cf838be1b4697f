//! Offset manager backed by its own commit log.

use crate::commitlog::entry::read_full;
use crate::commitlog::{CommitLog, CommitLogOptions, HEADER_LEN, LEN_PREFIX};
use crate::error::{Result, ResultExt};
use crate::offset::{Offset, OffsetManager};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Directory name prefix for offset logs, followed by the consumer name.
pub const OFFSET_LOG_PREFIX: &str = "__consumer_offsets-";

/// Segment size for offset logs (1 GiB).
pub const OFFSET_SEGMENT_BYTES: u64 = 1024 * 1024 * 1024;

struct Inner {
    log: CommitLog,
    offsets: HashMap<String, u64>,
}

/// Durable offset manager.
///
/// The map and the log share one mutex so the map never runs ahead of what
/// has been appended.
pub struct LogManager {
    name: String,
    inner: Mutex<Inner>,
}

impl LogManager {
    /// Open (or create) the offset log for consumer `name` under `path` and
    /// rebuild the offset map from it.
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = path.as_ref().join(format!("{}{}", OFFSET_LOG_PREFIX, name));
        let log = CommitLog::open(CommitLogOptions::new(&dir).max_segment_bytes(OFFSET_SEGMENT_BYTES))
            .with_context(|| format!("Failed to open offset log for {}", name))?;
        let offsets = build_map(&log)?;
        tracing::info!(
            consumer = name,
            namespaces = offsets.len(),
            "Offset map rebuilt"
        );
        Ok(Self {
            name: name.to_string(),
            inner: Mutex::new(Inner { log, offsets }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(inner: &mut Inner, offset: Offset) -> Result<()> {
        inner.log.append(&offset.to_log_entry())?;
        inner.offsets.insert(offset.namespace, offset.log_offset);
        Ok(())
    }
}

impl OffsetManager for LogManager {
    fn commit_offset(&self, offset: Offset) -> Result<()> {
        let mut inner = self.lock();
        if let Some(&current) = inner.offsets.get(&offset.namespace) {
            if current >= offset.log_offset {
                tracing::debug!(
                    consumer = %self.name,
                    namespace = %offset.namespace,
                    current,
                    offset = offset.log_offset,
                    "Offset already committed"
                );
                return Ok(());
            }
        }
        Self::append(&mut inner, offset)
    }

    fn commit_offset_override(&self, offset: Offset) -> Result<()> {
        let mut inner = self.lock();
        Self::append(&mut inner, offset)
    }

    fn offset_map(&self) -> HashMap<String, u64> {
        self.lock().offsets.clone()
    }
}

/// Replay every offset record in `log`. Later records win.
fn build_map(log: &CommitLog) -> Result<HashMap<String, u64>> {
    let mut offsets = HashMap::new();
    let mut reader = log.reader_from_start();
    let mut header = [0u8; HEADER_LEN];
    let mut len_buf = [0u8; LEN_PREFIX];
    let mut value_buf = [0u8; 8];

    loop {
        if read_full(&mut reader, &mut header)? < HEADER_LEN
            || read_full(&mut reader, &mut len_buf)? < LEN_PREFIX
        {
            break;
        }
        let mut key = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        if read_full(&mut reader, &mut key)? < key.len()
            || read_full(&mut reader, &mut len_buf)? < LEN_PREFIX
            || read_full(&mut reader, &mut value_buf)? < value_buf.len()
        {
            break;
        }
        let namespace = String::from_utf8_lossy(&key).into_owned();
        offsets.insert(namespace, u64::from_be_bytes(value_buf));
    }
    Ok(offsets)
}
