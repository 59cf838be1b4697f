//! JSON file backed state store.

use crate::error::{Result, ResultExt, TransitError};
use crate::state::{State, Store};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Snapshot file name inside the store directory.
pub const STATE_FILE: &str = "transit_state.json";

/// Persists all states as one JSON object keyed by namespace.
///
/// Each apply rewrites the file through a temporary sibling and a rename, so
/// readers only ever see a complete snapshot.
pub struct FileStore {
    path: PathBuf,
    states: Mutex<BTreeMap<String, State>>,
}

impl FileStore {
    /// Open the store in `dir`, loading any existing snapshot.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
        let path = dir.join(STATE_FILE);

        let states = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content).map_err(|e| {
                TransitError::from(e).with_context(format!("Failed to parse {}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), states = states.len(), "State store opened");

        Ok(Self {
            path,
            states: Mutex::new(states),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, states: &BTreeMap<String, State>) -> Result<()> {
        let content = serde_json::to_string_pretty(states)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl Store for FileStore {
    fn apply(&self, state: State) -> Result<()> {
        if state.namespace.is_empty() {
            return Err(TransitError::EmptyNamespace);
        }
        let mut states = self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        states.insert(state.namespace.clone(), state);
        self.persist(&states)
    }

    fn all(&self) -> Result<Vec<State>> {
        // BTreeMap iteration is already namespace order.
        Ok(self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect())
    }
}
