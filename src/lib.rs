//! # transit: resumable record pipelines
//!
//! transit moves records from one source system to any number of sinks
//! through a tree of stages. Every stage may filter or transform what passes
//! through it. The source appends each record to a segmented commit log and
//! each sink durably commits the log offset it has written, so a restarted
//! pipeline resumes where its sinks left off.
//!
//! ## Architecture
//!
//! - **Commit log** (`commitlog`): append-only, segment-based binary log
//! - **Offsets** (`offset`): namespace → last delivered offset per sink
//! - **State** (`state`): per-namespace snapshots used as source resume hints
//! - **Events** (`events`): Boot / Metrics / Exit / Error protocol and emitter
//! - **Pipe** (`pipe`): bounded fan-out edges between stages
//! - **Pipeline** (`pipeline`): stage tree, run/stop, metrics and state tickers
//! - **Connectors** (`adaptor`, `function`, `registry`): sources, sinks and
//!   transforms, looked up by name
//!
//! ## Configuration
//!
//! Pipelines are described in TOML (see [`config`]). Commit logs, offset logs
//! and state snapshots are stored under `data_dir`, defaulting to the
//! platform data directory:
//!
//! - **Linux**: `~/.local/share/transit/`
//! - **macOS**: `~/Library/Application Support/transit/`
//! - **Windows**: `%APPDATA%\transit\`
//!
//! ## Example
//!
//! ```ignore
//! use transit::{config::PipelineConfig, pipeline::PipelineBuilder, registry::Registry};
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = Registry::with_builtins();
//!     let config = PipelineConfig::load("pipeline.toml")?;
//!     let pipeline = PipelineBuilder::new(config, &registry).build()?;
//!
//!     let result = pipeline.run();
//!     pipeline.stop();
//!     Ok(result?)
//! }
//! ```

pub mod adaptor;
pub mod commitlog;
pub mod config;
pub mod error;
pub mod events;
pub mod function;
pub mod message;
pub mod offset;
pub mod pipe;
pub mod pipeline;
pub mod registry;
pub mod state;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{Result, TransitError};
pub use message::{Document, Op, Record};
pub use pipeline::{Pipeline, PipelineBuilder, StageTree};
pub use registry::Registry;
