//! A single node of the stage tree.
//!
//! The root stage reads from its source adaptor and appends every record to
//! its commit log before fanning it out. Every other stage runs a listen loop
//! that filters, transforms and writes the records arriving on its inbound
//! edge, then commits the record's offset.

use crate::adaptor::{self, Client, ReadContext, Reader, RecordSet, ResumePoint, Writer};
use crate::commitlog::{CommitLog, LogEntry, Mode};
use crate::error::{AdaptorError, ErrorLevel, Result, TransitError};
use crate::function::AnyFunction;
use crate::message::{Document, Op, Record};
use crate::offset::{Offset, OffsetManager};
use crate::pipe::Pipe;
use crate::pipeline::id::StageId;
use crate::state::State;
use crossbeam_channel::{bounded, Receiver, Sender};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Regex over record namespaces.
///
/// Patterns may be written wrapped in slashes (`/^db\..*/`); the slashes are
/// stripped. An empty pattern matches everything.
#[derive(Clone, Default)]
pub struct NamespaceFilter(Option<Regex>);

const MATCH_ALL: &str = ".*";

impl NamespaceFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim_matches('/');
        if trimmed.is_empty() || trimmed == MATCH_ALL {
            return Ok(Self::all());
        }
        Ok(Self(Some(Regex::new(trimmed)?)))
    }

    /// Filter matching every namespace.
    pub fn all() -> Self {
        Self(None)
    }

    pub fn matches(&self, namespace: &str) -> bool {
        self.0.as_ref().map_or(true, |re| re.is_match(namespace))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_ref().map_or(MATCH_ALL, Regex::as_str)
    }
}

impl fmt::Debug for NamespaceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespaceFilter(/{}/)", self.as_str())
    }
}

/// A function applied to the records of matching namespaces.
#[derive(Debug)]
pub struct Transform {
    pub name: String,
    pub filter: NamespaceFilter,
    pub function: AnyFunction,
}

impl Transform {
    pub fn new(name: impl Into<String>, function: impl Into<AnyFunction>) -> Self {
        Self {
            name: name.into(),
            filter: NamespaceFilter::all(),
            function: function.into(),
        }
    }

    pub fn with_filter(mut self, filter: NamespaceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Records outside the filter pass through untouched. A function result
    /// of `None` or an `Op::Skip` record drops the record.
    pub fn apply(&self, record: Record) -> Result<Option<Record>> {
        if !self.filter.matches(&record.namespace) {
            return Ok(Some(record));
        }
        let out = self.function.apply(record)?;
        Ok(out.filter(|r| r.op != Op::Skip))
    }
}

/// Everything needed to add a stage to a [`StageTree`](crate::pipeline::StageTree).
pub struct StageSpec {
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) filter: NamespaceFilter,
    pub(crate) client: Option<Arc<dyn Client>>,
    pub(crate) reader: Option<Arc<dyn Reader>>,
    pub(crate) writer: Option<Arc<dyn Writer>>,
    pub(crate) transforms: Vec<Transform>,
    pub(crate) offsets: Option<Arc<dyn OffsetManager>>,
    pub(crate) commit_log: Option<Arc<CommitLog>>,
}

impl StageSpec {
    /// `kind` is the name of the adaptor type backing the stage.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            filter: NamespaceFilter::all(),
            client: None,
            reader: None,
            writer: None,
            transforms: Vec::new(),
            offsets: None,
            commit_log: None,
        }
    }

    pub fn namespace(mut self, pattern: &str) -> Result<Self> {
        self.filter = NamespaceFilter::new(pattern)?;
        Ok(self)
    }

    pub fn client(mut self, client: Arc<dyn Client>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn Reader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn Writer>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn offsets(mut self, offsets: Arc<dyn OffsetManager>) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn commit_log(mut self, log: Arc<CommitLog>) -> Self {
        self.commit_log = Some(log);
        self
    }
}

/// A stage in the tree.
pub struct Stage {
    id: StageId,
    name: String,
    kind: String,
    path: String,
    parent: StageId,
    pub(crate) children: Vec<StageId>,
    filter: NamespaceFilter,
    client: Option<Arc<dyn Client>>,
    reader: Option<Arc<dyn Reader>>,
    writer: Option<Arc<dyn Writer>>,
    transforms: Vec<Transform>,
    offsets: Option<Arc<dyn OffsetManager>>,
    commit_log: Option<Arc<CommitLog>>,
    pub(crate) pipe: Pipe,

    stopped: AtomicBool,
    /// Dropped on stop; disconnects the reader's `done` receiver.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl Stage {
    pub(crate) fn new(
        spec: StageSpec,
        id: StageId,
        parent: StageId,
        path: String,
        pipe: Pipe,
    ) -> Self {
        let (done_tx, done_rx) = bounded(0);
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            path,
            parent,
            children: Vec::new(),
            filter: spec.filter,
            client: spec.client,
            reader: spec.reader,
            writer: spec.writer,
            transforms: spec.transforms,
            offsets: spec.offsets,
            commit_log: spec.commit_log,
            pipe,
            stopped: AtomicBool::new(false),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adaptor type name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Slash-separated names from the root down to this stage.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `StageId::INVALID` for the root.
    pub fn parent(&self) -> StageId {
        self.parent
    }

    pub fn children(&self) -> &[StageId] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        !self.parent.is_valid()
    }

    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    pub fn filter(&self) -> &NamespaceFilter {
        &self.filter
    }

    pub fn offsets(&self) -> Option<&Arc<dyn OffsetManager>> {
        self.offsets.as_ref()
    }

    pub fn commit_log(&self) -> Option<&Arc<CommitLog>> {
        self.commit_log.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run this stage's receive loop until it is stopped.
    pub fn listen(&self) -> Result<()> {
        tracing::info!(path = %self.path, "adaptor Listening...");
        self.pipe.listen(|record, offset| self.apply(record, offset))
    }

    /// Stop the pipe and signal the reader. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(path = %self.path, "adaptor Stopping...");
        self.pipe.stop();
        self.done_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        tracing::info!(path = %self.path, "adaptor Stopped");
    }

    /// Write path of a non-root stage.
    ///
    /// Adaptor errors below `ErrorLevel::Error` are reported on the error
    /// channel and the record is dropped; the stage keeps running. Anything
    /// else fails the pipe.
    pub(crate) fn apply(&self, record: Record, offset: &Offset) -> Result<Option<Record>> {
        match self.write_record(record, offset) {
            Err(e) if !e.is_fatal() => {
                tracing::warn!(path = %self.path, offset = offset.log_offset, "{}", e);
                let _ = self.pipe.error_sender().send(e);
                Ok(None)
            }
            other => other,
        }
    }

    fn write_record(&self, record: Record, offset: &Offset) -> Result<Option<Record>> {
        if !self.filter.matches(&record.namespace) {
            tracing::trace!(
                path = %self.path,
                namespace = %record.namespace,
                "Namespace filtered, forwarding"
            );
            self.commit(offset)?;
            return Ok(Some(record));
        }

        let flattened = record.flatten();
        let Some(record) = self
            .apply_transforms(record)
            .map_err(|e| self.annotate(e, &flattened))?
        else {
            self.commit(offset)?;
            return Ok(None);
        };

        let mut record = match (&self.client, &self.writer) {
            (Some(client), Some(writer)) => {
                let flattened = record.flatten();
                adaptor::write(client.as_ref(), writer.as_ref(), record)
                    .map_err(|e| self.annotate(e, &flattened))?
            }
            _ => record,
        };

        self.commit(offset)?;
        record.confirm();
        Ok(Some(record))
    }

    fn apply_transforms(&self, record: Record) -> Result<Option<Record>> {
        if record.op == Op::Command {
            return Ok(Some(record));
        }
        let mut current = record;
        for transform in &self.transforms {
            match transform.apply(current)? {
                Some(next) => current = next,
                None => {
                    tracing::trace!(path = %self.path, transform = %transform.name, "Record dropped");
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }

    fn commit(&self, offset: &Offset) -> Result<()> {
        match &self.offsets {
            Some(offsets) => offsets.commit_offset(offset.clone()),
            None => Ok(()),
        }
    }

    /// Attach this stage's path and the offending record to `err`.
    fn annotate(&self, err: TransitError, record: &BTreeMap<String, String>) -> TransitError {
        match err {
            TransitError::Adaptor(mut e) => {
                if e.path.is_empty() {
                    e.path = self.path.clone();
                }
                if e.record.is_empty() {
                    e.record = record.clone();
                }
                TransitError::Adaptor(e)
            }
            other => AdaptorError::new(ErrorLevel::Error, self.path.clone(), other.to_string())
                .with_record(record.clone())
                .into(),
        }
    }

    /// Read the source to exhaustion (or until stopped), appending each
    /// record to the commit log and sending it down the pipe. `observe` sees
    /// the resume state of every record read.
    pub(crate) fn read_source<F>(
        &self,
        states: Vec<State>,
        resume: BTreeMap<String, ResumePoint>,
        mut observe: F,
    ) -> Result<()>
    where
        F: FnMut(State),
    {
        let (Some(client), Some(reader)) = (&self.client, &self.reader) else {
            return Err(TransitError::FuncNotSupported {
                name: self.kind.clone(),
                func: "Reader".to_string(),
            });
        };
        let ctx = ReadContext {
            session: client.connect()?,
            filter: self.filter.clone(),
            states,
            resume,
            done: self.done_rx.clone(),
        };
        tracing::info!(path = %self.path, "adaptor Starting...");

        for item in reader.read(ctx)? {
            if self.pipe.is_stopped() {
                tracing::debug!(path = %self.path, "Stopped, abandoning read");
                break;
            }
            let set = item.map_err(|e| e.with_context(format!("{} read failed", self.path)))?;
            observe(set.state());
            let offset = self.append(&set)?;
            self.pipe.send(set.record, offset);
        }
        Ok(())
    }

    fn append(&self, set: &RecordSet) -> Result<Offset> {
        let namespace = &set.record.namespace;
        let log_offset = match &self.commit_log {
            Some(log) => log.append(&LogEntry {
                key: namespace.as_bytes().to_vec(),
                value: serde_json::to_vec(&set.record.document)?,
                timestamp: set.timestamp.max(0) as u64,
                mode: set.mode,
                op: set.record.op,
            })?,
            None => self.pipe.message_count(),
        };
        Ok(Offset::new(namespace.clone(), log_offset, set.timestamp))
    }

    /// The newest commit-log record of each namespace. Every child gets
    /// those records through [`replay`](Self::replay), so the source may
    /// pick up after them. A copy that was not the last thing logged is
    /// known to have finished.
    pub(crate) fn resume_points(&self) -> Result<BTreeMap<String, ResumePoint>> {
        let mut points = BTreeMap::new();
        let Some(log) = &self.commit_log else {
            return Ok(points);
        };
        if log.is_empty() {
            return Ok(points);
        }
        let last = log.newest_offset() - 1;
        let mut newest: BTreeMap<Vec<u8>, (u64, LogEntry)> = BTreeMap::new();
        let mut reader = log.reader_from_start();
        while let Some((offset, entry)) = reader.next_entry()? {
            newest.insert(entry.key.clone(), (offset, entry));
        }
        for (offset, entry) in newest.into_values() {
            let namespace = String::from_utf8_lossy(&entry.key).into_owned();
            let document: Document = serde_json::from_slice(&entry.value)?;
            let mut record = Record::new(entry.op, namespace.clone(), document);
            record.timestamp = entry.timestamp as i64;
            let mode = match entry.mode {
                Mode::Copy if offset != last => Mode::Complete,
                mode => mode,
            };
            points.insert(namespace, ResumePoint { record, mode });
        }
        tracing::info!(path = %self.path, namespaces = points.len(), "Loaded resume points from commit log");
        Ok(points)
    }

    /// Push the commit-log entries `child` has not committed yet into the
    /// edge at `index`. Returns `ResumeStopped` if this stage is stopped
    /// part way through.
    pub(crate) fn replay(&self, index: usize, child: &Stage) -> Result<()> {
        let (Some(log), Some(offsets)) = (&self.commit_log, &child.offsets) else {
            return Ok(());
        };
        if log.is_empty() {
            return Ok(());
        }
        let last = log.newest_offset() - 1;
        let committed = offsets.newest_offset();
        if committed.is_some_and(|c| c >= last) {
            tracing::debug!(path = %child.path, offset = last, "Up to date, nothing to resume");
            return Ok(());
        }
        let start = committed.map_or(log.oldest_offset(), |c| (c + 1).max(log.oldest_offset()));
        tracing::info!(path = %child.path, from = start, to = last, "Resuming from commit log");

        let mut reader = log.reader(start)?;
        let mut replayed = 0u64;
        while let Some((log_offset, entry)) = reader.next_entry()? {
            if self.pipe.is_stopped() {
                return Err(TransitError::ResumeStopped);
            }
            let namespace = String::from_utf8_lossy(&entry.key).into_owned();
            let document: Document = serde_json::from_slice(&entry.value)?;
            let mut record = Record::new(entry.op, namespace.clone(), document);
            record.timestamp = entry.timestamp as i64;
            let offset = Offset::new(namespace, log_offset, record.timestamp);
            if !self.pipe.send_to(index, record, offset) {
                return Err(TransitError::ResumeStopped);
            }
            replayed += 1;
        }
        tracing::info!(path = %child.path, replayed, "Resume complete");
        Ok(())
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("filter", &self.filter)
            .field("children", &self.children)
            .field("transforms", &self.transforms.len())
            .finish()
    }
}
