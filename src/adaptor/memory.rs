//! In-memory source and sink.
//!
//! Used by tests and for wiring up pipelines without external systems. A
//! `MemoryAdaptor` serves a fixed list of records as a source and collects
//! everything written to it into a shared [`MemorySink`].

use crate::adaptor::{
    construct, Adaptor, Client, Config, ReadContext, Reader, RecordSet, RecordStream, Session,
    WriteFn, Writer,
};
use crate::commitlog::Mode;
use crate::error::{AdaptorError, ErrorLevel, Result};
use crate::message::{Document, Op, Record};
use crate::state::Identifier;
use serde::Deserialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DESCRIPTION: &str = "an adaptor that reads from and writes to process memory";

pub const SAMPLE_CONFIG: &str = r#"type = "memory"
[config]
namespace = "test.items"
documents = [{ _id = 1 }, { _id = 2 }]
delay_ms = 0"#;

#[derive(Debug, Default, Deserialize)]
struct MemoryConfig {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    delay_ms: u64,
}

/// Shared handle onto the records written to a memory sink.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<Record> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn push(&self, record: Record) {
        self.lock().push(record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Record>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Memory-backed adaptor.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdaptor {
    source: Arc<Vec<Record>>,
    sink: MemorySink,
    delay: Duration,
    fail_level: Option<ErrorLevel>,
}

impl MemoryAdaptor {
    /// A source serving `records` in order.
    pub fn source(records: Vec<Record>) -> Self {
        Self {
            source: Arc::new(records),
            ..Self::default()
        }
    }

    /// An empty sink.
    pub fn sink() -> Self {
        Self::default()
    }

    /// Build from a configuration table.
    pub fn from_config(config: &Config) -> Result<Self> {
        let conf: MemoryConfig = construct(config)?;
        let records = conf
            .documents
            .into_iter()
            .map(|doc| Record::new(Op::Insert, conf.namespace.clone(), doc))
            .collect();
        Ok(Self::source(records).with_delay(Duration::from_millis(conf.delay_ms)))
    }

    /// Sleep for `delay` before each write.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every write with an error of `level`.
    pub fn failing(mut self, level: ErrorLevel) -> Self {
        self.fail_level = Some(level);
        self
    }

    /// Handle onto the written records.
    pub fn written(&self) -> MemorySink {
        self.sink.clone()
    }
}

struct MemorySession;

impl Session for MemorySession {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Client for MemoryAdaptor {
    fn connect(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(MemorySession))
    }
}

impl Reader for MemoryAdaptor {
    fn read(&self, ctx: ReadContext) -> Result<RecordStream> {
        let records = Arc::clone(&self.source);
        // index of the logged record per namespace, everything up to it is skipped
        let logged_through: BTreeMap<String, i64> = ctx
            .resume
            .iter()
            .filter_map(|(namespace, point)| {
                records
                    .iter()
                    .rposition(|r| {
                        r.namespace == *namespace && r.document == point.record.document
                    })
                    .map(|i| (namespace.clone(), i as i64))
            })
            .collect();
        let mut index = 0usize;
        Ok(Box::new(std::iter::from_fn(move || loop {
            if ctx.is_done() {
                return None;
            }
            let record = records.get(index)?.clone();
            let position = index as i64;
            index += 1;
            if !ctx.filter.matches(&record.namespace) {
                continue;
            }
            if let Some(state) = ctx.state_for(&record.namespace) {
                if matches!(state.identifier, Identifier::Int(done) if position <= done) {
                    continue;
                }
            }
            if logged_through.get(&record.namespace).is_some_and(|&done| position <= done) {
                continue;
            }
            return Some(Ok(RecordSet::new(record, Mode::Copy, Identifier::Int(position))));
        })))
    }
}

impl Writer for MemoryAdaptor {
    fn write(&self, record: Record) -> WriteFn {
        let sink = self.sink.clone();
        let delay = self.delay;
        let fail_level = self.fail_level;
        Box::new(move |_session: &mut dyn Session| {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            if let Some(level) = fail_level {
                return Err(AdaptorError::new(level, "", "memory write rejected")
                    .with_record(record.flatten())
                    .into());
            }
            sink.push(record.clone());
            Ok(record)
        })
    }
}

impl Adaptor for MemoryAdaptor {
    fn client(&self) -> Result<Arc<dyn Client>> {
        Ok(Arc::new(self.clone()))
    }

    fn reader(&self) -> Result<Arc<dyn Reader>> {
        Ok(Arc::new(self.clone()))
    }

    fn writer(&self) -> Result<Arc<dyn Writer>> {
        Ok(Arc::new(self.clone()))
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &str {
        SAMPLE_CONFIG
    }
}
