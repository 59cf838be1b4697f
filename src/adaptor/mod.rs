//! Connector interfaces.
//!
//! An adaptor hands out up to three capabilities:
//! - a [`Client`] that opens [`Session`]s to the external system,
//! - a [`Reader`] (sources) producing a lazy stream of [`RecordSet`]s,
//! - a [`Writer`] (sinks) turning a record into a [`WriteFn`] run against a
//!   session.
//!
//! Adaptors are constructed by name from a [`Registry`](crate::registry::Registry).

pub mod file;
pub mod memory;

use crate::commitlog::Mode;
use crate::error::Result;
use crate::message::Record;
use crate::pipeline::NamespaceFilter;
use crate::state::{self, Identifier, State};
use crossbeam_channel::{Receiver, TryRecvError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Free-form adaptor or function configuration.
pub type Config = serde_json::Map<String, Value>;

/// Deserialize a typed configuration struct out of a [`Config`] table.
pub fn construct<T: DeserializeOwned>(config: &Config) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(config.clone()))?)
}

/// An open connection to the external system.
pub trait Session: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Release the connection. Called once, when the session is done with.
    fn close(&mut self) {}
}

/// Opens sessions.
pub trait Client: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Session>>;
}

/// One record produced by a reader, with where it stands in its namespace.
#[derive(Debug, Clone)]
pub struct RecordSet {
    pub record: Record,
    /// Unix seconds.
    pub timestamp: i64,
    pub mode: Mode,
    /// Position the reader can resume after.
    pub identifier: Identifier,
}

impl RecordSet {
    pub fn new(record: Record, mode: Mode, identifier: Identifier) -> Self {
        Self {
            timestamp: record.timestamp,
            record,
            mode,
            identifier,
        }
    }

    /// Snapshot describing this record's position in its namespace.
    pub fn state(&self) -> State {
        let mode = match self.mode {
            Mode::Copy => state::Mode::Copy,
            Mode::Sync | Mode::Complete => state::Mode::Sync,
        };
        State {
            identifier: self.identifier.clone(),
            mode,
            namespace: self.record.namespace.clone(),
            timestamp: self.timestamp.max(0) as u64,
        }
    }
}

/// Lazily produced reader output. Each item is pulled on demand by the
/// source stage.
pub type RecordStream = Box<dyn Iterator<Item = Result<RecordSet>> + Send>;

/// The newest record of a namespace already in the source commit log.
///
/// Every record in the log reaches every child, directly or by replay, so a
/// reader can skip everything up to and including `record`. `mode` is
/// `Complete` when a copy was in progress and other namespaces have been
/// logged since.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub record: Record,
    pub mode: Mode,
}

/// Everything a reader gets to start one pass over its source.
pub struct ReadContext {
    pub session: Box<dyn Session>,
    pub filter: NamespaceFilter,
    /// Last persisted state per namespace, sorted by namespace.
    pub states: Vec<State>,
    /// Per namespace, the last record the commit log already holds.
    pub resume: BTreeMap<String, ResumePoint>,
    /// Disconnects when the source stage is stopped.
    pub done: Receiver<()>,
}

impl ReadContext {
    /// Whether the stage has been stopped.
    pub fn is_done(&self) -> bool {
        is_done(&self.done)
    }

    /// Stored state for `namespace`, if any.
    pub fn state_for(&self, namespace: &str) -> Option<&State> {
        self.states.iter().find(|s| s.namespace == namespace)
    }

    pub fn resume_for(&self, namespace: &str) -> Option<&ResumePoint> {
        self.resume.get(namespace)
    }
}

/// Non-blocking check of a `done` signal.
pub fn is_done(done: &Receiver<()>) -> bool {
    matches!(done.try_recv(), Err(TryRecvError::Disconnected))
}

/// Source capability.
pub trait Reader: Send + Sync {
    fn read(&self, ctx: ReadContext) -> Result<RecordStream>;
}

/// Deferred write of one record against a session.
pub type WriteFn = Box<dyn FnOnce(&mut dyn Session) -> Result<Record> + Send>;

/// Sink capability.
pub trait Writer: Send + Sync {
    fn write(&self, record: Record) -> WriteFn;
}

/// A connector constructed from configuration.
pub trait Adaptor: Send + Sync {
    fn client(&self) -> Result<Arc<dyn Client>>;

    fn reader(&self) -> Result<Arc<dyn Reader>>;

    fn writer(&self) -> Result<Arc<dyn Writer>>;

    fn description(&self) -> &str;

    fn sample_config(&self) -> &str {
        ""
    }
}

/// Connect a fresh session, run the writer's function for `record` against
/// it and close the session again.
pub fn write(client: &dyn Client, writer: &dyn Writer, record: Record) -> Result<Record> {
    let op = writer.write(record);
    let mut session = client.connect()?;
    let result = op(session.as_mut());
    session.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransitError;
    use crate::message::{Document, Op};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        connects: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    struct CountingSession(Arc<AtomicUsize>);

    impl Session for CountingSession {
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        fn close(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Client for Counting {
        fn connect(&self) -> Result<Box<dyn Session>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession(Arc::clone(&self.closes))))
        }
    }

    struct Rejecting;

    impl Writer for Rejecting {
        fn write(&self, _record: Record) -> WriteFn {
            Box::new(|_| Err(TransitError::Channel("rejected".into())))
        }
    }

    #[test]
    fn test_write_closes_session_on_error() {
        let client = Counting::default();
        let result = write(&client, &Rejecting, Record::new(Op::Insert, "a.b", Document::new()));
        assert!(result.is_err());
        assert_eq!(client.connects.load(Ordering::SeqCst), 1);
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_construct() {
        #[derive(serde::Deserialize)]
        struct Conf {
            uri: String,
        }
        let mut config = Config::new();
        config.insert("uri".into(), Value::String("stdout://".into()));
        let conf: Conf = construct(&config).unwrap();
        assert_eq!(conf.uri, "stdout://");
        assert!(construct::<Conf>(&Config::new()).is_err());
    }

    #[test]
    fn test_record_set_state() {
        let record = Record::new(Op::Insert, "db.c", Document::new());
        let set = RecordSet::new(record, Mode::Complete, Identifier::Int(4));
        let state = set.state();
        assert_eq!(state.mode, state::Mode::Sync);
        assert_eq!(state.namespace, "db.c");
        assert_eq!(state.identifier, Identifier::Int(4));
    }
}
