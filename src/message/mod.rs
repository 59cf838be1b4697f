//! Records carried through the stage tree.
//!
//! A `Record` wraps one document read from a source together with the
//! operation that produced it and the namespace (database/collection) it
//! belongs to. Records are owned by exactly one stage at a time; fan-out
//! clones them once per child edge.

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Ordered key → value document.
pub type Document = serde_json::Map<String, Value>;

/// The operation a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    #[default]
    Insert,
    Update,
    Delete,
    /// Administrative records; never passed through transforms.
    Command,
    Noop,
    /// Set by a transform to drop the record.
    Skip,
}

impl Op {
    /// 3-bit encoding used in commit log attributes.
    pub fn to_bits(self) -> u8 {
        match self {
            Op::Insert => 0,
            Op::Update => 1,
            Op::Delete => 2,
            Op::Command => 3,
            Op::Noop => 4,
            Op::Skip => 5,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Op::Insert),
            1 => Some(Op::Update),
            2 => Some(Op::Delete),
            3 => Some(Op::Command),
            4 => Some(Op::Noop),
            5 => Some(Op::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Insert => "insert",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::Command => "command",
            Op::Noop => "noop",
            Op::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// A document in flight, tagged with its operation and namespace.
#[derive(Debug, Clone)]
pub struct Record {
    pub op: Op,
    pub namespace: String,
    pub document: Document,
    /// Unix seconds at which transit created the record.
    pub timestamp: i64,
    ack: Option<Sender<()>>,
}

impl Record {
    pub fn new(op: Op, namespace: impl Into<String>, document: Document) -> Self {
        Self {
            op,
            namespace: namespace.into(),
            document,
            timestamp: chrono::Utc::now().timestamp(),
            ack: None,
        }
    }

    /// Attach a one-shot acknowledgement. The returned receiver is signalled
    /// when [`Record::confirm`] is called; each copy of the record (fan-out
    /// clones included) confirms at most once.
    pub fn with_ack(mut self) -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(1);
        self.ack = Some(tx);
        (self, rx)
    }

    /// Fire the acknowledgement, if one is attached. Returns whether a signal
    /// was delivered.
    pub fn confirm(&mut self) -> bool {
        match self.ack.take() {
            Some(tx) => tx.try_send(()).is_ok(),
            None => false,
        }
    }

    pub fn has_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// String form of the `_id` field, if present.
    pub fn id(&self) -> Option<String> {
        self.document.get("_id").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Flattened `key → string` view of the document, used for error reporting.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        self.document
            .iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), s)
            })
            .collect()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op && self.namespace == other.namespace && self.document == other.document
    }
}

/// Build a `Document` from a JSON object literal. Non-object values yield an
/// empty document.
pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
