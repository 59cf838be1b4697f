//! Stage trees and the pipeline that runs them.
//!
//! Records flow from the source stage down a tree of stages:
//!
//! ```text
//! [source] ─┬─► [sink A] ──► [sink A1]
//!           └─► [sink B]
//! ```
//!
//! # Design
//!
//! - **Arena storage**: stages live in a flat `Vec` inside [`StageTree`] and
//!   refer to each other by [`StageId`].
//! - **Thread per stage**: each non-root stage runs its own listen loop;
//!   parent and child talk only through their [`Pipe`](crate::pipe::Pipe).
//! - **Durable progress**: the source appends every record to a commit log
//!   and each sink commits the offsets it has written, so a restarted
//!   pipeline replays only what a sink has not seen.

pub mod builder;
pub mod executor;
pub mod id;
pub mod stage;
pub mod tree;

pub use builder::{PipelineBuilder, COMMIT_LOG_DIR};
pub use executor::{
    Pipeline, PipelineOptions, DEFAULT_METRICS_INTERVAL, DEFAULT_STATE_INTERVAL,
};
pub use id::StageId;
pub use stage::{NamespaceFilter, Stage, StageSpec, Transform};
pub use tree::StageTree;
