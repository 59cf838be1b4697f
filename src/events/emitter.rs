//! Event consumer thread.

use crate::events::Event;
use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Sink for events drained by an [`Emitter`].
pub type EmitFn = Arc<dyn Fn(&Event) + Send + Sync>;

/// Drains the shared event channel on its own thread.
pub struct Emitter {
    stop_tx: Sender<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Emitter {
    pub fn start(events: Receiver<Event>, emit: EmitFn) -> Self {
        let (stop_tx, stop_rx) = bounded::<Sender<()>>(0);
        let handle = std::thread::Builder::new()
            .name("transit-emitter".to_string())
            .spawn(move || run(events, stop_rx, emit))
            .ok();
        if handle.is_none() {
            tracing::error!("Failed to spawn emitter thread, events will not be emitted");
        }
        Self { stop_tx, handle }
    }

    /// Emit whatever is still queued, then shut the worker down. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let (ack_tx, ack_rx) = bounded(1);
        if self.stop_tx.send(ack_tx).is_ok() {
            let _ = ack_rx.recv();
        }
        if handle.join().is_err() {
            tracing::error!("Emitter thread panicked");
        }
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(events: Receiver<Event>, stop_rx: Receiver<Sender<()>>, emit: EmitFn) {
    let mut events = events;
    loop {
        select! {
            recv(stop_rx) -> ack => {
                for event in events.try_iter() {
                    emit(&event);
                }
                if let Ok(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
            recv(events) -> event => match event {
                Ok(event) => emit(&event),
                Err(_) => events = never(),
            }
        }
    }
}

/// Write each event to the log at info level.
pub fn log_emit() -> EmitFn {
    Arc::new(|event: &Event| tracing::info!(target: "transit::events", "{}", event))
}

/// Discard every event.
pub fn noop_emit() -> EmitFn {
    Arc::new(|_: &Event| {})
}

/// Write each event as one line of JSON.
pub fn json_lines_emit<W: Write + Send + 'static>(writer: W) -> EmitFn {
    let writer = Mutex::new(writer);
    Arc::new(move |event: &Event| {
        let line = match event.to_json() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode {} event: {}", event.kind(), e);
                return;
            }
        };
        let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            tracing::warn!("Failed to write event: {}", e);
        }
    })
}
