//! Keep only the listed fields.

use crate::error::Result;
use crate::function::Function;
use crate::message::Record;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pick {
    pub fields: Vec<String>,
}

impl Pick {
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

impl Function for Pick {
    fn name(&self) -> &str {
        "pick"
    }

    fn apply(&self, mut record: Record) -> Result<Option<Record>> {
        record.document.retain(|key, _| self.fields.iter().any(|f| f == key));
        Ok(Some(record))
    }
}
