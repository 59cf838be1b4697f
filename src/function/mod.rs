//! Per-record transform functions.
//!
//! Two-layer design, the same as stages use for connectors:
//! - **`Function` trait**: the single capability every transform provides.
//! - **`BuiltinFunction` enum**: the functions shipped with transit, matched
//!   directly instead of going through a vtable.
//!
//! `AnyFunction` wraps either so a stage's transform chain is one `Vec`.

pub mod omit;
pub mod opfilter;
pub mod pick;
pub mod skip;

pub use omit::Omit;
pub use opfilter::OpFilter;
pub use pick::Pick;
pub use skip::Skip;

use crate::error::Result;
use crate::message::Record;

/// A transform applied to each record passing through a stage.
///
/// Returning `Ok(None)` drops the record without error.
pub trait Function: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, record: Record) -> Result<Option<Record>>;
}

/// Enum dispatch for built-in functions.
#[derive(Debug, Clone)]
pub enum BuiltinFunction {
    Pick(Pick),
    Omit(Omit),
    Skip(Skip),
    OpFilter(OpFilter),
}

impl BuiltinFunction {
    pub fn name(&self) -> &str {
        match self {
            BuiltinFunction::Pick(f) => f.name(),
            BuiltinFunction::Omit(f) => f.name(),
            BuiltinFunction::Skip(f) => f.name(),
            BuiltinFunction::OpFilter(f) => f.name(),
        }
    }

    pub fn apply(&self, record: Record) -> Result<Option<Record>> {
        match self {
            BuiltinFunction::Pick(f) => f.apply(record),
            BuiltinFunction::Omit(f) => f.apply(record),
            BuiltinFunction::Skip(f) => f.apply(record),
            BuiltinFunction::OpFilter(f) => f.apply(record),
        }
    }
}

/// Either a built-in function or a user-supplied one.
pub enum AnyFunction {
    Builtin(BuiltinFunction),
    Plugin(Box<dyn Function>),
}

impl AnyFunction {
    pub fn name(&self) -> &str {
        match self {
            AnyFunction::Builtin(f) => f.name(),
            AnyFunction::Plugin(f) => f.name(),
        }
    }

    pub fn apply(&self, record: Record) -> Result<Option<Record>> {
        match self {
            AnyFunction::Builtin(f) => f.apply(record),
            AnyFunction::Plugin(f) => f.apply(record),
        }
    }
}

impl From<BuiltinFunction> for AnyFunction {
    fn from(f: BuiltinFunction) -> Self {
        AnyFunction::Builtin(f)
    }
}

impl std::fmt::Debug for AnyFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyFunction::Builtin(b) => f.debug_tuple("Builtin").field(b).finish(),
            AnyFunction::Plugin(p) => f.debug_tuple("Plugin").field(&p.name()).finish(),
        }
    }
}
