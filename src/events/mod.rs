//! Lifecycle and metrics events.
//!
//! Every stage in a tree shares one bounded event channel. The pipeline
//! emits `boot` and `exit` around a run, a `metrics` event per stage on each
//! harvest, and an `error` event for every error reported by a stage.
//!
//! Wire shapes (JSON, empty optional fields omitted):
//!
//! ```text
//! {"ts":..,"name":"boot","version":"..","endpoints":{..}}
//! {"ts":..,"name":"metrics","path":"..","records":..}
//! {"ts":..,"name":"exit","version":"..","endpoints":{..}}
//! {"ts":..,"name":"error","path":"..","record":{..},"message":".."}
//! ```

mod emitter;

pub use emitter::{json_lines_emit, log_emit, noop_emit, EmitFn, Emitter};

use crossbeam_channel::{SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Capacity of the shared event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 10;

/// How long a producer waits for room in the event channel before dropping.
pub const EVENT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Stage name → connector type.
pub type Endpoints = BTreeMap<String, String>;

/// A single event. `ts` is Unix time in nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Event {
    Boot {
        ts: i64,
        version: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        endpoints: Endpoints,
    },
    Metrics {
        ts: i64,
        path: String,
        records: u64,
    },
    Exit {
        ts: i64,
        version: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        endpoints: Endpoints,
    },
    Error {
        ts: i64,
        path: String,
        record: BTreeMap<String, String>,
        message: String,
    },
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

impl Event {
    pub fn boot(version: impl Into<String>, endpoints: Endpoints) -> Self {
        Event::Boot {
            ts: now_nanos(),
            version: version.into(),
            endpoints,
        }
    }

    pub fn metrics(path: impl Into<String>, records: u64) -> Self {
        Event::Metrics {
            ts: now_nanos(),
            path: path.into(),
            records,
        }
    }

    pub fn exit(version: impl Into<String>, endpoints: Endpoints) -> Self {
        Event::Exit {
            ts: now_nanos(),
            version: version.into(),
            endpoints,
        }
    }

    pub fn error(
        path: impl Into<String>,
        record: BTreeMap<String, String>,
        message: impl Into<String>,
    ) -> Self {
        Event::Error {
            ts: now_nanos(),
            path: path.into(),
            record,
            message: message.into(),
        }
    }

    /// The `name` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Boot { .. } => "boot",
            Event::Metrics { .. } => "metrics",
            Event::Exit { .. } => "exit",
            Event::Error { .. } => "error",
        }
    }

    pub fn ts(&self) -> i64 {
        match self {
            Event::Boot { ts, .. }
            | Event::Metrics { ts, .. }
            | Event::Exit { ts, .. }
            | Event::Error { ts, .. } => *ts,
        }
    }

    /// Compact JSON encoding.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Boot { endpoints, .. } | Event::Exit { endpoints, .. } => {
                write!(f, "{} {:?}", self.kind(), endpoints)
            }
            Event::Metrics { path, records, .. } => {
                write!(f, "metrics {} records: {}", path, records)
            }
            Event::Error {
                path,
                record,
                message,
                ..
            } => write!(f, "error {} record: {:?}, message: {}", path, record, message),
        }
    }
}

/// Producer handle onto the shared event channel.
///
/// Sends wait at most [`EVENT_SEND_TIMEOUT`] for room; if nothing drains the
/// channel the event is dropped with a warning.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }

    /// Returns whether the event was queued.
    pub fn emit(&self, event: Event) -> bool {
        match self.tx.send_timeout(event, EVENT_SEND_TIMEOUT) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(event)) => {
                tracing::warn!(kind = event.kind(), "Event channel full, dropping event");
                false
            }
            Err(SendTimeoutError::Disconnected(event)) => {
                tracing::debug!(kind = event.kind(), "Event channel closed, dropping event");
                false
            }
        }
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("queued", &self.tx.len())
            .finish()
    }
}
