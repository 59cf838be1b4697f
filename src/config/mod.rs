//! Pipeline configuration.
//!
//! A pipeline is described by one TOML file: run settings at the top level
//! and a `[source]` table whose `children` nest to form the stage tree.
//! `${VAR}` references are replaced with environment variables before the
//! file is parsed.
//!
//! # Data Location
//!
//! Commit logs, offset logs and state snapshots live under `data_dir`, which
//! defaults to the platform data directory:
//! - **Linux**: `~/.local/share/transit/`
//! - **macOS**: `~/Library/Application Support/transit/`
//! - **Windows**: `%APPDATA%\transit\`
//!
//! # Example
//!
//! ```toml
//! version = "0.1.0"
//! metrics_interval_ms = 1000
//! compaction_interval_ms = 3600000
//!
//! [source]
//! name = "in"
//! type = "file"
//! [source.config]
//! uri = "file://${HOME}/in.json"
//!
//! [[source.children]]
//! name = "out"
//! type = "file"
//! [source.children.config]
//! uri = "stdout://"
//! ```

use crate::adaptor;
use crate::error::{Result, TransitError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "transit";

/// Default interval between Metrics events in milliseconds
pub const DEFAULT_METRICS_INTERVAL_MS: u64 = 1000;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Replace every `${VAR}` with the value of the environment variable `VAR`.
///
/// Fails listing every variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            missing.push(caps[1].to_string());
            String::new()
        })
    });
    if !missing.is_empty() {
        return Err(TransitError::Config(format!(
            "Missing environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(result.into_owned())
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_metrics_interval_ms() -> u64 {
    DEFAULT_METRICS_INTERVAL_MS
}

/// Top level of a pipeline file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Reported in Boot and Exit events
    #[serde(default = "default_version")]
    pub version: String,

    /// Where commit logs and state live; platform data dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Enables the file state store when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_interval_ms: Option<u64>,

    /// Segment size of the source commit log; the log default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_segment_bytes: Option<u64>,

    /// How often the source commit log is compacted; hourly when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_interval_ms: Option<u64>,

    pub source: StageConfig,
}

/// One stage and, recursively, its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// Adaptor name in the registry
    #[serde(rename = "type")]
    pub kind: String,

    /// Namespace filter, `/regex/` or bare regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Adaptor-specific settings
    #[serde(default, skip_serializing_if = "adaptor::Config::is_empty")]
    pub config: adaptor::Config,

    /// Applied in order before the stage writes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StageConfig>,
}

/// A function in a stage's transform chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Function name in the registry
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "adaptor::Config::is_empty")]
    pub config: adaptor::Config,
}

impl PipelineConfig {
    /// Parse TOML after environment substitution.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let substituted = substitute_env_vars(input)?;
        toml::from_str(&substituted)
            .map_err(|e| TransitError::Config(format!("Failed to parse pipeline config: {}", e)))
    }

    /// Load a pipeline file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TransitError::Config(format!("Failed to read pipeline file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| e.with_context(format!("Loading {}", path.display())))
    }

    /// Save as TOML. `${VAR}` references are not preserved.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransitError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TransitError::Config(format!("Failed to serialize pipeline: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            TransitError::Config(format!("Failed to write pipeline file {:?}: {}", path, e))
        })
    }

    /// Configured data directory, or the platform default.
    pub fn data_dir(&self) -> Result<PathBuf> {
        self.data_dir
            .clone()
            .or_else(app_data_dir)
            .ok_or_else(|| TransitError::Config("Could not determine data directory".to_string()))
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.max(1))
    }

    pub fn state_interval(&self) -> Option<Duration> {
        self.state_interval_ms.map(|ms| Duration::from_millis(ms.max(1)))
    }

    pub fn compaction_interval(&self) -> Option<Duration> {
        self.compaction_interval_ms.map(|ms| Duration::from_millis(ms.max(1)))
    }
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            namespace: None,
            config: adaptor::Config::new(),
            transforms: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: adaptor::Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_child(mut self, child: StageConfig) -> Self {
        self.children.push(child);
        self
    }
}
