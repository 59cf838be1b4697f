//! Error handling for transit
//!
//! This module defines the crate error type and a Result alias used
//! throughout the pipeline, commit log and adaptor layers.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Main error type for transit operations
#[derive(Error, Debug)]
pub enum TransitError {
    /// IO errors from the commit log, state store or file adaptor
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A commit log was configured with an empty directory path
    #[error("commit log path is empty")]
    EmptyPath,

    /// No segment covers the requested offset
    #[error("segment not found")]
    SegmentNotFound,

    /// The requested offset is not present in the segment
    #[error("offset {0} not found")]
    OffsetNotFound(u64),

    /// A commit log record could not be decoded
    #[error("corrupt log entry at position {position}: {reason}")]
    CorruptEntry { position: u64, reason: String },

    /// A record too large for the 32-bit length fields of the log format
    #[error("log entry too large: key {key_len} bytes, value {value_len} bytes")]
    EntryTooLarge { key_len: usize, value_len: usize },

    /// `listen` was called on a pipe without an inbound edge
    #[error("unable to listen: pipe has no inbound edge")]
    UnableToListen,

    /// A state snapshot was applied without a namespace
    #[error("namespace may not be empty")]
    EmptyNamespace,

    /// Errors raised by a source or sink connector
    #[error(transparent)]
    Adaptor(#[from] AdaptorError),

    /// Registry lookup for an adaptor failed
    #[error("adaptor '{0}' not found in registry")]
    AdaptorNotFound(String),

    /// Registry lookup for a function failed
    #[error("function '{0}' not found in registry")]
    FunctionNotFound(String),

    /// An adaptor was asked for a capability it does not have
    #[error("'{name}' does not support '{func}' function")]
    FuncNotSupported { name: String, func: String },

    /// A transform function rejected a record or its configuration
    #[error("function error: {0}")]
    Function(String),

    /// Errors related to configuration loading/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A namespace filter failed to compile
    #[error("Invalid namespace filter: {0}")]
    NamespaceFilter(#[from] regex::Error),

    /// The pipe was stopped while a child was being replayed from the commit log
    #[error("pipe has been stopped, canceling resume")]
    ResumeStopped,

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<TransitError>,
    },
}

impl TransitError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        TransitError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the adaptor error behind this error, looking through context wrappers.
    pub fn as_adaptor(&self) -> Option<&AdaptorError> {
        match self {
            TransitError::Adaptor(e) => Some(e),
            TransitError::WithContext { source, .. } => source.as_adaptor(),
            _ => None,
        }
    }

    /// Whether this error must stop the whole stage tree.
    ///
    /// Only adaptor errors below `ErrorLevel::Error` are recoverable.
    pub fn is_fatal(&self) -> bool {
        self.as_adaptor().map_or(true, |e| e.level.is_fatal())
    }
}

/// Severity attached to connector errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorLevel {
    pub fn is_fatal(self) -> bool {
        self >= ErrorLevel::Error
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorLevel::Info => "INFO",
            ErrorLevel::Warning => "WARNING",
            ErrorLevel::Error => "ERROR",
            ErrorLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// An error raised by a connector while handling a record.
///
/// Carries the stage path and a flattened copy of the offending record so the
/// pipeline can report it as an Error event.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{level}: {message} (path: {path})")]
pub struct AdaptorError {
    pub level: ErrorLevel,
    pub path: String,
    pub message: String,
    pub record: BTreeMap<String, String>,
}

impl AdaptorError {
    pub fn new(level: ErrorLevel, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            path: path.into(),
            message: message.into(),
            record: BTreeMap::new(),
        }
    }

    pub fn with_record(mut self, record: BTreeMap<String, String>) -> Self {
        self.record = record;
        self
    }
}

/// Result type alias for transit operations
pub type Result<T> = std::result::Result<T, TransitError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| TransitError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TransitError::Io(e).with_context(f()))
    }
}
