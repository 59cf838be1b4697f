//! Drop the listed fields.

use crate::error::Result;
use crate::function::Function;
use crate::message::Record;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Omit {
    pub fields: Vec<String>,
}

impl Omit {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl Function for Omit {
    fn name(&self) -> &str {
        "omit"
    }

    fn apply(&self, mut record: Record) -> Result<Option<Record>> {
        record.document.retain(|key, _| !self.fields.contains(key));
        Ok(Some(record))
    }
}
