//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use transit::events::{EmitFn, Event};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Events captured by [`collecting_emit`].
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    /// The last `stages` events before Exit, as `(path, records)`. These are
    /// the final Metrics round.
    pub fn final_metrics(&self, stages: usize) -> Vec<(String, u64)> {
        let events = self.events();
        let exit = events
            .iter()
            .rposition(|e| e.kind() == "exit")
            .expect("no exit event");
        events[exit - stages..exit]
            .iter()
            .map(|e| match e {
                Event::Metrics { path, records, .. } => (path.clone(), *records),
                other => panic!("expected metrics, got {:?}", other),
            })
            .collect()
    }
}

/// An emit function recording every event.
pub fn collecting_emit() -> (EmitFn, EventLog) {
    let log = EventLog::default();
    let sink = log.clone();
    let emit: EmitFn = Arc::new(move |event: &Event| sink.0.lock().unwrap().push(event.clone()));
    (emit, log)
}

/// Poll `cond` until it holds or the timeout expires.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
