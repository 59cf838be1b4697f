//! Coarse per-namespace progress snapshots.
//!
//! A reader attaches a [`State`] to every record it emits. The pipeline keeps
//! the newest one per namespace and periodically persists them through a
//! [`Store`], so a restarted reader can tell whether a namespace was still
//! being copied or had already moved on to tailing.

mod file_store;

pub use file_store::{FileStore, STATE_FILE};

use crate::error::{Result, TransitError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Opaque resume cursor chosen by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identifier {
    #[default]
    None,
    Int(i64),
    Str(String),
    ObjectId(String),
}

/// Whether a namespace is being bulk copied or tailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Copy,
    Sync,
}

/// Progress snapshot for one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub identifier: Identifier,
    #[serde(default)]
    pub mode: Mode,
    pub namespace: String,
    /// Unix seconds.
    pub timestamp: u64,
}

impl State {
    pub fn new(namespace: impl Into<String>, identifier: Identifier, mode: Mode) -> Self {
        Self {
            identifier,
            mode,
            namespace: namespace.into(),
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }
}

/// Keyed snapshot storage. One state per namespace survives; last write wins.
pub trait Store: Send + Sync {
    fn apply(&self, state: State) -> Result<()>;

    /// Every stored state, sorted by namespace.
    fn all(&self) -> Result<Vec<State>>;
}

/// Volatile store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn apply(&self, state: State) -> Result<()> {
        if state.namespace.is_empty() {
            return Err(TransitError::EmptyNamespace);
        }
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(state.namespace.clone(), state);
        Ok(())
    }

    fn all(&self) -> Result<Vec<State>> {
        let mut states: Vec<State> = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        states.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        Ok(states)
    }
}
