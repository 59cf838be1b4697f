//! Drop records by operation.

use crate::error::Result;
use crate::function::Function;
use crate::message::{Op, Record};
use serde::Deserialize;

/// Keeps records whose op is in `whitelist` (when set) and not in
/// `blacklist`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpFilter {
    #[serde(default)]
    pub whitelist: Vec<Op>,
    #[serde(default)]
    pub blacklist: Vec<Op>,
}

impl Function for OpFilter {
    fn name(&self) -> &str {
        "opfilter"
    }

    fn apply(&self, record: Record) -> Result<Option<Record>> {
        if !self.whitelist.is_empty() && !self.whitelist.contains(&record.op) {
            return Ok(None);
        }
        if self.blacklist.contains(&record.op) {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Document;

    fn record(op: Op) -> Record {
        Record::new(op, "db.c", Document::new())
    }

    #[test]
    fn test_whitelist() {
        let f: OpFilter = serde_json::from_str(r#"{"whitelist": ["insert"]}"#).unwrap();
        assert!(f.apply(record(Op::Insert)).unwrap().is_some());
        assert!(f.apply(record(Op::Delete)).unwrap().is_none());
    }

    #[test]
    fn test_blacklist() {
        let f: OpFilter = serde_json::from_str(r#"{"blacklist": ["delete"]}"#).unwrap();
        assert!(f.apply(record(Op::Update)).unwrap().is_some());
        assert!(f.apply(record(Op::Delete)).unwrap().is_none());
    }
}
