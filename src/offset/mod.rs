//! Durable per-namespace delivery offsets.
//!
//! Every sink stage owns an offset manager. After a record has been written,
//! the stage commits the record's commit-log offset under its namespace; on
//! restart the manager rebuilds the namespace → offset map so the source can
//! replay only what the sink has not seen yet.

mod log_manager;

pub use log_manager::{LogManager, OFFSET_LOG_PREFIX, OFFSET_SEGMENT_BYTES};

use crate::commitlog::{LogEntry, Mode};
use crate::error::Result;
use crate::message::Op;
use std::collections::HashMap;
use std::sync::Mutex;

/// Position of a record in the source commit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offset {
    pub namespace: String,
    pub log_offset: u64,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Offset {
    pub fn new(namespace: impl Into<String>, log_offset: u64, timestamp: i64) -> Self {
        Self {
            namespace: namespace.into(),
            log_offset,
            timestamp,
        }
    }

    /// Commit-log form of this offset: key is the namespace, value is the
    /// 8-byte big-endian log offset.
    pub fn to_log_entry(&self) -> LogEntry {
        LogEntry {
            key: self.namespace.as_bytes().to_vec(),
            value: self.log_offset.to_be_bytes().to_vec(),
            timestamp: self.timestamp.max(0) as u64,
            mode: Mode::Sync,
            op: Op::Noop,
        }
    }
}

/// Tracks the last delivered offset per namespace.
pub trait OffsetManager: Send + Sync {
    /// Record `offset` if it is ahead of the namespace's current value.
    /// Stale commits are a no-op, not an error.
    fn commit_offset(&self, offset: Offset) -> Result<()>;

    /// Record `offset` unconditionally.
    fn commit_offset_override(&self, offset: Offset) -> Result<()>;

    /// Snapshot of the namespace → offset map.
    fn offset_map(&self) -> HashMap<String, u64>;

    /// Highest committed offset across all namespaces.
    fn newest_offset(&self) -> Option<u64> {
        self.offset_map().into_values().max()
    }
}

/// Non-durable manager, used by tests and by sinks configured without a data
/// directory.
#[derive(Debug, Default)]
pub struct MemoryManager {
    offsets: Mutex<HashMap<String, u64>>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.offsets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OffsetManager for MemoryManager {
    fn commit_offset(&self, offset: Offset) -> Result<()> {
        let mut offsets = self.lock();
        if let Some(&current) = offsets.get(&offset.namespace) {
            if current >= offset.log_offset {
                tracing::debug!(
                    namespace = %offset.namespace,
                    current,
                    offset = offset.log_offset,
                    "Ignoring stale offset commit"
                );
                return Ok(());
            }
        }
        offsets.insert(offset.namespace, offset.log_offset);
        Ok(())
    }

    fn commit_offset_override(&self, offset: Offset) -> Result<()> {
        self.lock().insert(offset.namespace, offset.log_offset);
        Ok(())
    }

    fn offset_map(&self) -> HashMap<String, u64> {
        self.lock().clone()
    }
}
