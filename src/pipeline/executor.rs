//! Pipeline run loop.
//!
//! A [`Pipeline`] owns a [`StageTree`] and drives it on a set of worker
//! threads:
//!
//! ```text
//!   transit-source   root read loop (resume, then new records)
//!   transit-<name>   one listen loop per non-root stage
//!   transit-errors   shared error channel → Error events, fatal → result
//!   transit-metrics  Metrics round every `metrics_interval`
//!   transit-state    snapshot of per-namespace progress every `state_interval`
//!   transit-compaction  namespace compaction of the source commit log
//!   transit-emitter  event channel → EmitFn
//! ```
//!
//! `run()` blocks until the source is exhausted and every stage has drained,
//! until the tree is stopped, or until a fatal error arrives. `stop()` tears
//! everything down and emits the final Metrics round and the Exit event.

use crate::commitlog::{CompactionStats, Compactor, NamespaceCompactor};
use crate::error::{Result, TransitError};
use crate::events::{EmitFn, Emitter, Event, EventSender};
use crate::pipeline::tree::StageTree;
use crate::state::{State, Store};
use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default interval between Metrics rounds.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Default interval between state snapshots.
pub const DEFAULT_STATE_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between commit-log compactions.
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Latest resume state per namespace, as seen by the source.
type LatestStates = Arc<Mutex<BTreeMap<String, State>>>;

/// Run-time settings of a [`Pipeline`].
#[derive(Clone)]
pub struct PipelineOptions {
    /// Reported in Boot and Exit events.
    pub version: String,
    pub metrics_interval: Duration,
    /// Enables resume hints and periodic snapshots.
    pub state_store: Option<Arc<dyn Store>>,
    pub state_interval: Duration,
    pub compaction_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            state_store: None,
            state_interval: DEFAULT_STATE_INTERVAL,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
        }
    }
}

impl std::fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("version", &self.version)
            .field("metrics_interval", &self.metrics_interval)
            .field("state_store", &self.state_store.is_some())
            .field("state_interval", &self.state_interval)
            .field("compaction_interval", &self.compaction_interval)
            .finish()
    }
}

/// Supervisor of one stage tree.
pub struct Pipeline {
    tree: Arc<StageTree>,
    options: PipelineOptions,
    events: EventSender,
    errors: Receiver<TransitError>,
    emitter: Mutex<Emitter>,
    latest: LatestStates,

    /// Dropped by `stop()`; wakes the error listener and the tickers.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl Pipeline {
    /// Validate `tree` and start the event emitter.
    pub fn new(tree: StageTree, emit: EmitFn, options: PipelineOptions) -> Result<Self> {
        tree.validate()?;
        let root = tree.root().pipe();
        let event_rx = root
            .event_receiver()
            .ok_or_else(|| TransitError::Channel("root pipe has no event channel".into()))?;
        let errors = root
            .error_receiver()
            .ok_or_else(|| TransitError::Channel("root pipe has no error channel".into()))?;
        let events = root.event_sender();
        let (done_tx, done_rx) = bounded(0);

        Ok(Self {
            tree: Arc::new(tree),
            options,
            events,
            errors,
            emitter: Mutex::new(Emitter::start(event_rx, emit)),
            latest: Arc::new(Mutex::new(BTreeMap::new())),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn tree(&self) -> &StageTree {
        &self.tree
    }

    pub fn version(&self) -> &str {
        &self.options.version
    }

    /// Run the tree until the source is exhausted, the pipeline is stopped or
    /// a fatal error arrives. Returns the fatal error, if any.
    ///
    /// An exhausted source stops the tree parent to child, so every record
    /// read has been through every stage by the time this returns `Ok`.
    pub fn run(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransitError::Config("pipeline is already running".into()));
        }
        tracing::info!(
            version = %self.options.version,
            stages = self.tree.len(),
            "Pipeline starting"
        );
        self.events
            .emit(Event::boot(self.options.version.clone(), self.tree.endpoints()));

        let states = self.load_states();
        let (result_tx, result_rx) = bounded::<Result<()>>(2);

        for stage in self.tree.stages().filter(|s| !s.is_root()) {
            let tree = Arc::clone(&self.tree);
            let id = stage.id();
            self.spawn(format!("transit-{}", stage.name()), move || {
                let stage = &tree[id];
                if let Err(e) = stage.listen() {
                    tracing::error!(path = %stage.path(), "Listen failed: {}", e);
                }
            })?;
        }

        self.spawn_metrics()?;
        self.spawn_state_saver()?;
        self.spawn_compaction()?;

        let (finished_tx, finished_rx) = bounded::<()>(1);
        {
            let tree = Arc::clone(&self.tree);
            let errors = self.errors.clone();
            let done = self.done_rx.clone();
            let events = self.events.clone();
            let result_tx = result_tx.clone();
            self.spawn("transit-errors".to_string(), move || {
                let result = listen_errors(&errors, &done, finished_rx, &events);
                let fatal = result.is_err();
                let _ = result_tx.send(result);
                if fatal {
                    tree.stop();
                }
            })?;
        }

        {
            let tree = Arc::clone(&self.tree);
            let latest = Arc::clone(&self.latest);
            self.spawn("transit-source".to_string(), move || {
                match start_source(&tree, states, &latest) {
                    Ok(()) => {
                        tree.stop();
                        let _ = finished_tx.send(());
                    }
                    Err(e) => {
                        tracing::error!(path = %tree.root().path(), "Source failed: {}", e);
                        let _ = result_tx.send(Err(e));
                    }
                }
            })?;
        }

        result_rx
            .recv()
            .unwrap_or_else(|_| Err(TransitError::Channel("pipeline workers exited".into())))
    }

    /// Stop the tree, emit the final Metrics round and the Exit event, and
    /// join every worker. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Pipeline stopping");
        let endpoints = self.tree.endpoints();
        self.tree.stop();
        lock(&self.done_tx).take();

        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            let name = worker.thread().name().unwrap_or("transit-worker").to_string();
            if worker.join().is_err() {
                tracing::error!(thread = %name, "Worker panicked");
            }
        }

        emit_metrics(&self.tree, &self.events);
        if let Some(store) = &self.options.state_store {
            save_states(store.as_ref(), &self.latest);
        }
        self.events
            .emit(Event::exit(self.options.version.clone(), endpoints));
        lock(&self.emitter).stop();
        tracing::info!("Pipeline stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stored states handed to the source reader as resume hints.
    fn load_states(&self) -> Vec<State> {
        let Some(store) = &self.options.state_store else {
            return Vec::new();
        };
        match store.all() {
            Ok(states) => {
                tracing::info!(count = states.len(), "Loaded resume state");
                states
            }
            Err(e) => {
                tracing::warn!("Failed to load state, starting from scratch: {}", e);
                Vec::new()
            }
        }
    }

    fn spawn_metrics(&self) -> Result<()> {
        let tree = Arc::clone(&self.tree);
        let events = self.events.clone();
        let done = self.done_rx.clone();
        let ticker = tick(self.options.metrics_interval);
        self.spawn("transit-metrics".to_string(), move || loop {
            select! {
                recv(done) -> _ => return,
                recv(ticker) -> _ => emit_metrics(&tree, &events),
            }
        })
    }

    fn spawn_state_saver(&self) -> Result<()> {
        let Some(store) = self.options.state_store.clone() else {
            return Ok(());
        };
        let latest = Arc::clone(&self.latest);
        let done = self.done_rx.clone();
        let ticker = tick(self.options.state_interval);
        self.spawn("transit-state".to_string(), move || loop {
            select! {
                recv(done) -> _ => return,
                recv(ticker) -> _ => save_states(store.as_ref(), &latest),
            }
        })
    }

    fn spawn_compaction(&self) -> Result<()> {
        if self.tree.root().commit_log().is_none() {
            return Ok(());
        }
        let tree = Arc::clone(&self.tree);
        let done = self.done_rx.clone();
        let interval = self.options.compaction_interval;
        let ticker = tick(interval);
        tracing::info!(?interval, "Starting compaction routine");
        self.spawn("transit-compaction".to_string(), move || loop {
            select! {
                recv(done) -> _ => {
                    tracing::info!("Stopping compaction routine");
                    return;
                }
                recv(ticker) -> _ => {
                    if let Err(e) = compact_source(&tree, &NamespaceCompactor) {
                        tracing::warn!("Compaction failed: {}", e);
                    }
                }
            }
        })
    }

    fn spawn<F>(&self, name: String, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new().name(name).spawn(f)?;
        lock(&self.workers).push(handle);
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("tree", &self.tree)
            .field("options", &self.options)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resume lagging children, then read the source.
fn start_source(
    tree: &StageTree,
    states: Vec<State>,
    latest: &Mutex<BTreeMap<String, State>>,
) -> Result<()> {
    let root = tree.root();
    let resume = root.resume_points()?;
    for (index, &child) in root.children().iter().enumerate() {
        match root.replay(index, &tree[child]) {
            Ok(()) => {}
            Err(TransitError::ResumeStopped) => {
                tracing::info!(path = %root.path(), "Stopped during resume");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    root.read_source(states, resume, |state| {
        lock(latest).insert(state.namespace.clone(), state);
    })?;
    tracing::info!(
        path = %root.path(),
        records = root.pipe().message_count(),
        "Source exhausted"
    );
    Ok(())
}

/// Compact the source commit log below the lowest offset committed by any
/// child. A child that has committed nothing holds everything back.
fn compact_source(tree: &StageTree, compactor: &dyn Compactor) -> Result<CompactionStats> {
    let root = tree.root();
    let Some(log) = root.commit_log() else {
        return Ok(CompactionStats::default());
    };
    let mut below = log.newest_offset();
    for &child in root.children() {
        if let Some(offsets) = tree[child].offsets() {
            below = below.min(offsets.newest_offset().unwrap_or(0));
        }
    }
    compactor.compact(log, below)
}

/// Report errors from the shared channel until `done` closes or the source
/// has finished and every stage has drained. Returns the first fatal error.
fn listen_errors(
    errors: &Receiver<TransitError>,
    done: &Receiver<()>,
    mut finished: Receiver<()>,
    events: &EventSender,
) -> Result<()> {
    loop {
        select! {
            recv(done) -> _ => return Ok(()),
            recv(errors) -> err => match err {
                Ok(err) => report(err, events)?,
                Err(_) => return Ok(()),
            },
            recv(finished) -> msg => {
                if msg.is_err() {
                    finished = never();
                    continue;
                }
                for err in errors.try_iter() {
                    report(err, events)?;
                }
                return Ok(());
            }
        }
    }
}

/// Emit an Error event for adaptor errors. Fatal errors are handed back.
fn report(err: TransitError, events: &EventSender) -> Result<()> {
    if let Some(e) = err.as_adaptor() {
        events.emit(Event::error(e.path.clone(), e.record.clone(), e.to_string()));
    }
    if err.is_fatal() {
        tracing::error!("Stopping pipeline: {}", err);
        return Err(err);
    }
    tracing::warn!("{}", err);
    Ok(())
}

/// One Metrics event per stage, breadth first.
fn emit_metrics(tree: &StageTree, events: &EventSender) {
    for stage in tree.breadth_first() {
        events.emit(Event::metrics(stage.path(), stage.pipe().message_count()));
    }
}

fn save_states(store: &dyn Store, latest: &Mutex<BTreeMap<String, State>>) {
    let states: Vec<State> = lock(latest).values().cloned().collect();
    for state in states {
        if let Err(e) = store.apply(state) {
            tracing::warn!("Failed to save state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::memory::MemoryAdaptor;
    use crate::commitlog::{CommitLog, CommitLogOptions, LogEntry, Mode};
    use crate::error::{AdaptorError, ErrorLevel};
    use crate::offset::{MemoryManager, Offset, OffsetManager};
    use crate::message::{document, Op, Record};
    use crate::pipeline::id::StageId;
    use crate::pipeline::stage::StageSpec;
    use crate::state::MemoryStore;
    use serde_json::json;

    fn collect() -> (EmitFn, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let emit: EmitFn = Arc::new(move |e: &Event| sink.lock().unwrap().push(e.clone()));
        (emit, seen)
    }

    fn records(n: i64) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new(Op::Insert, "test.items", document(json!({"_id": i}))))
            .collect()
    }

    fn tree(source: MemoryAdaptor, sink: &MemoryAdaptor) -> StageTree {
        let mut tree = StageTree::new(
            StageSpec::new("src", "memory")
                .client(Arc::new(source.clone()))
                .reader(Arc::new(source)),
        );
        tree.add_child(
            StageId::ROOT,
            StageSpec::new("out", "memory")
                .client(Arc::new(sink.clone()))
                .writer(Arc::new(sink.clone())),
        )
        .unwrap();
        tree
    }

    #[test]
    fn test_new_rejects_childless_source() {
        let lonely = StageTree::new(StageSpec::new("src", "memory"));
        let (emit, _) = collect();
        assert!(Pipeline::new(lonely, emit, PipelineOptions::default()).is_err());
    }

    #[test]
    fn test_error_listener_keeps_going_on_warning() {
        let (tx, errors) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::bounded(10);
        let events = EventSender::new(event_tx);
        let (_done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let (_finished_tx, finished) = crossbeam_channel::bounded::<()>(1);

        tx.send(AdaptorError::new(ErrorLevel::Warning, "src/out", "slow").into())
            .unwrap();
        tx.send(AdaptorError::new(ErrorLevel::Critical, "src/out", "down").into())
            .unwrap();

        let err = listen_errors(&errors, &done, finished, &events).unwrap_err();
        assert_eq!(err.as_adaptor().unwrap().message, "down");
        let kinds: Vec<_> = event_rx.try_iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["error", "error"]);
    }

    #[test]
    fn test_fatal_write_error_ends_run() {
        let sink = MemoryAdaptor::sink().failing(ErrorLevel::Critical);
        let (emit, seen) = collect();
        let pipeline = Pipeline::new(
            tree(MemoryAdaptor::source(records(3)), &sink),
            emit,
            PipelineOptions::default(),
        )
        .unwrap();

        let err = pipeline.run().unwrap_err();
        assert_eq!(err.as_adaptor().unwrap().path, "src/out");
        pipeline.stop();

        let events = seen.lock().unwrap();
        let errors: Vec<_> = events.iter().filter(|e| e.kind() == "error").collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(events.iter().filter(|e| e.kind() == "exit").count(), 1);
    }

    #[test]
    fn test_run_then_stop() {
        let sink = MemoryAdaptor::sink();
        let (emit, seen) = collect();
        let store = Arc::new(MemoryStore::new());
        let options = PipelineOptions {
            version: "test".into(),
            state_store: Some(store.clone()),
            ..PipelineOptions::default()
        };
        let pipeline =
            Pipeline::new(tree(MemoryAdaptor::source(records(5)), &sink), emit, options).unwrap();

        pipeline.run().unwrap();
        pipeline.stop();
        pipeline.stop();

        assert_eq!(sink.written().len(), 5);
        let events = seen.lock().unwrap();
        assert_eq!(events.first().map(Event::kind), Some("boot"));
        assert_eq!(events.last().map(Event::kind), Some("exit"));
        assert_eq!(events.iter().filter(|e| e.kind() == "exit").count(), 1);
        let finals: Vec<_> = events
            .iter()
            .rev()
            .skip(1)
            .take(2)
            .map(|e| match e {
                Event::Metrics { path, records, .. } => (path.clone(), *records),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(finals, vec![("src/out".to_string(), 5), ("src".to_string(), 5)]);

        let states = store.all().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].identifier, crate::state::Identifier::Int(4));
    }

    #[test]
    fn test_compaction_held_back_by_slowest_child() {
        let dir = tempfile::tempdir().unwrap();
        let entry = |id: u64| LogEntry {
            key: b"test.items".to_vec(),
            value: format!("{{\"_id\":{}}}", id).into_bytes(),
            timestamp: id,
            mode: Mode::Copy,
            op: Op::Insert,
        };
        let max = entry(0).encoded_len() as u64 * 2;
        let log = Arc::new(
            CommitLog::open(CommitLogOptions::new(dir.path()).max_segment_bytes(max)).unwrap(),
        );
        for id in 0..6 {
            log.append(&entry(id)).unwrap();
        }

        let source = MemoryAdaptor::source(Vec::new());
        let mut tree = StageTree::new(
            StageSpec::new("src", "memory")
                .client(Arc::new(source.clone()))
                .reader(Arc::new(source))
                .commit_log(log.clone()),
        );
        let fast = Arc::new(MemoryManager::new());
        let slow = Arc::new(MemoryManager::new());
        for (name, offsets) in [("fast", &fast), ("slow", &slow)] {
            let sink = MemoryAdaptor::sink();
            tree.add_child(
                StageId::ROOT,
                StageSpec::new(name, "memory")
                    .client(Arc::new(sink.clone()))
                    .writer(Arc::new(sink))
                    .offsets(offsets.clone()),
            )
            .unwrap();
        }

        fast.commit_offset(Offset::new("test.items", 5, 0)).unwrap();
        assert_eq!(
            compact_source(&tree, &NamespaceCompactor).unwrap(),
            CompactionStats::default()
        );

        slow.commit_offset(Offset::new("test.items", 4, 0)).unwrap();
        let stats = compact_source(&tree, &NamespaceCompactor).unwrap();
        assert_eq!(stats, CompactionStats { segments: 2, removed: 2 });

        let mut reader = log.reader_from_start();
        let mut offsets = Vec::new();
        while let Some((offset, _)) = reader.next_entry().unwrap() {
            offsets.push(offset);
        }
        assert_eq!(offsets, vec![1, 3, 4, 5]);
    }
}
