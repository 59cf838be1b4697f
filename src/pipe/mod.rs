//! Fan-out edges between stages.
//!
//! A [`Pipe`] links one stage to its children. The root pipe allocates the
//! tree-wide error and event channels; every child pipe inherits them and
//! reads its records from a bounded edge appended to its parent's outbound
//! list.
//!
//! ```text
//!            ┌──────────── error channel (shared, unbounded) ───────────┐
//!            │  ┌───────── event channel (shared, bounded 10) ───────┐  │
//!   root ──edge(10)──► child A ──edge(10)──► grandchild               │  │
//!        └─edge(10)──► child B                                        │  │
//! ```
//!
//! Delivery to siblings is sequential in attach order, so a slow child
//! holds up the children attached after it.

use crate::error::{Result, TransitError};
use crate::events::{Event, EventSender, EVENT_CHANNEL_CAPACITY};
use crate::message::Record;
use crate::offset::Offset;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Capacity of each parent → child edge.
pub const EDGE_CAPACITY: usize = 10;

/// How long one handoff attempt waits before re-checking the stopped flag.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// A record together with the commit-log offset it was appended at.
#[derive(Debug, Clone)]
pub struct TrackedRecord {
    pub record: Record,
    pub offset: Offset,
}

/// Communication endpoint owned by one stage.
pub struct Pipe {
    path: String,
    inbound: Option<Receiver<TrackedRecord>>,
    outbound: Vec<Sender<TrackedRecord>>,

    error_tx: Sender<TransitError>,
    error_rx: Option<Receiver<TransitError>>,
    events: EventSender,
    event_rx: Option<Receiver<Event>>,

    /// Set by `stop()` or by an apply error; aborts pending handoffs.
    stopped: AtomicBool,
    /// Set once an apply error has been reported.
    failed: AtomicBool,
    /// Latch making `stop()` run once.
    closed: AtomicBool,
    listening: AtomicBool,
    message_count: AtomicU64,

    /// Dropped by `stop()` to signal the listen loop.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    /// The listen loop reports here once it has returned.
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl Pipe {
    fn with_channels(
        path: String,
        inbound: Option<Receiver<TrackedRecord>>,
        error_tx: Sender<TransitError>,
        error_rx: Option<Receiver<TransitError>>,
        events: EventSender,
        event_rx: Option<Receiver<Event>>,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded(0);
        let (done_tx, done_rx) = bounded(1);
        Self {
            path,
            inbound,
            outbound: Vec::new(),
            error_tx,
            error_rx,
            events,
            event_rx,
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            done_tx,
            done_rx,
        }
    }

    /// Create the root pipe of a tree, allocating the shared channels.
    pub fn new_root(path: impl Into<String>) -> Self {
        let (error_tx, error_rx) = unbounded();
        let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        Self::with_channels(
            path.into(),
            None,
            error_tx,
            Some(error_rx),
            EventSender::new(event_tx),
            Some(event_rx),
        )
    }

    /// Create a pipe fed by a new edge appended to `parent`.
    pub fn new_child(parent: &mut Pipe, path: impl Into<String>) -> Self {
        let (tx, rx) = bounded(EDGE_CAPACITY);
        parent.outbound.push(tx);
        Self::with_channels(
            path.into(),
            Some(rx),
            parent.error_tx.clone(),
            None,
            parent.events.clone(),
            None,
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Records sent (or, for leaves, consumed) so far.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether the listen loop reported an apply error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn child_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn error_sender(&self) -> Sender<TransitError> {
        self.error_tx.clone()
    }

    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// The shared error channel. `None` on non-root pipes.
    pub fn error_receiver(&self) -> Option<Receiver<TransitError>> {
        self.error_rx.clone()
    }

    /// The shared event channel. `None` on non-root pipes.
    pub fn event_receiver(&self) -> Option<Receiver<Event>> {
        self.event_rx.clone()
    }

    /// Fan `record` out to every child, in attach order.
    ///
    /// If the pipe is stopped while a handoff is pending, the remaining
    /// children of this call are skipped; the child being waited on may or
    /// may not have received the record.
    pub fn send(&self, record: Record, offset: Offset) {
        self.message_count.fetch_add(1, Ordering::SeqCst);
        let tracked = TrackedRecord { record, offset };
        for (index, edge) in self.outbound.iter().enumerate() {
            if !self.handoff(edge, tracked.clone()) {
                tracing::debug!(
                    path = %self.path,
                    child = index,
                    offset = tracked.offset.log_offset,
                    "Pipe stopped, abandoning send"
                );
                return;
            }
        }
    }

    /// Hand `record` to the child attached at `index` only. Returns whether
    /// the handoff completed.
    pub fn send_to(&self, index: usize, record: Record, offset: Offset) -> bool {
        match self.outbound.get(index) {
            Some(edge) => self.handoff(edge, TrackedRecord { record, offset }),
            None => false,
        }
    }

    fn handoff(&self, edge: &Sender<TrackedRecord>, mut tracked: TrackedRecord) -> bool {
        loop {
            match edge.send_timeout(tracked, SEND_TIMEOUT) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(t)) => {
                    if self.is_stopped() {
                        return false;
                    }
                    tracked = t;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    tracing::debug!(path = %self.path, "Child edge closed, skipping");
                    return true;
                }
            }
        }
    }

    /// Run the receive loop until `stop()` is called.
    ///
    /// `apply` returns the record to forward, `None` to drop it, or an error,
    /// which is pushed onto the shared error channel and marks the pipe
    /// stopped. Records arriving after an error are discarded.
    pub fn listen<F>(&self, mut apply: F) -> Result<()>
    where
        F: FnMut(Record, &Offset) -> Result<Option<Record>>,
    {
        let Some(inbound) = self.inbound.as_ref() else {
            return Err(TransitError::UnableToListen);
        };
        self.listening.store(true, Ordering::SeqCst);
        tracing::debug!(path = %self.path, "Listening");

        let mut inbound = inbound.clone();
        loop {
            select! {
                recv(self.stop_rx) -> _ => break,
                recv(inbound) -> msg => match msg {
                    Ok(tracked) => self.process(tracked, &mut apply),
                    Err(_) => inbound = never(),
                },
            }
        }

        let buffered = inbound.len();
        if buffered > 0 {
            tracing::info!(
                path = %self.path,
                buffer_length = buffered,
                "Received stop, draining message buffer"
            );
        }
        for tracked in inbound.try_iter() {
            self.process(tracked, &mut apply);
        }

        tracing::debug!(path = %self.path, "Listen closed");
        self.listening.store(false, Ordering::SeqCst);
        let _ = self.done_tx.try_send(());
        Ok(())
    }

    fn process<F>(&self, tracked: TrackedRecord, apply: &mut F)
    where
        F: FnMut(Record, &Offset) -> Result<Option<Record>>,
    {
        if self.is_failed() {
            tracing::debug!(
                path = %self.path,
                offset = tracked.offset.log_offset,
                "Pipe failed, discarding record"
            );
            return;
        }
        match apply(tracked.record, &tracked.offset) {
            Ok(Some(record)) => {
                if self.outbound.is_empty() {
                    self.message_count.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.send(record, tracked.offset);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(path = %self.path, "{}", e);
                self.failed.store(true, Ordering::SeqCst);
                self.stopped.store(true, Ordering::SeqCst);
                let _ = self.error_tx.send(e);
            }
        }
    }

    /// Stop this pipe. Idempotent. If a listen loop is running, waits for it
    /// to drain its buffered records and return.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if self.listening.load(Ordering::SeqCst) {
            let _ = self.done_rx.recv();
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("path", &self.path)
            .field("children", &self.outbound.len())
            .field("stopped", &self.is_stopped())
            .field("message_count", &self.message_count())
            .finish()
    }
}
