//! Keep only records whose field satisfies a comparison.

use crate::error::{Result, TransitError};
use crate::function::Function;
use crate::message::Record;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct SkipConfig {
    field: String,
    operator: String,
    r#match: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "SkipConfig")]
pub struct Skip {
    pub field: String,
    pub operator: String,
    pub r#match: Value,
    /// Compiled `match` for the `=~` operator.
    pattern: Option<Regex>,
}

impl Skip {
    /// Fails if `operator` is `=~` and `match` is not a valid regex.
    pub fn new(
        field: impl Into<String>,
        operator: impl Into<String>,
        r#match: Value,
    ) -> Result<Self> {
        let operator = operator.into();
        let pattern = match (operator.as_str(), &r#match) {
            ("=~", Value::String(p)) => {
                Some(Regex::new(p).map_err(|e| TransitError::Function(e.to_string()))?)
            }
            _ => None,
        };
        Ok(Self {
            field: field.into(),
            operator,
            r#match,
            pattern,
        })
    }

    fn keep(&self, value: Option<&Value>) -> Result<bool> {
        let value = value.unwrap_or(&Value::Null);
        match self.operator.as_str() {
            "==" | "eq" | "$eq" => Ok(*value == self.r#match),
            "=~" => match (&self.pattern, value) {
                (Some(re), Value::String(s)) => Ok(re.is_match(s)),
                _ => Ok(false),
            },
            ">" | "gt" | "$gt" => Ok(self.compare(value)? > 0.0),
            ">=" | "gte" | "$gte" => Ok(self.compare(value)? >= 0.0),
            "<" | "lt" | "$lt" => Ok(self.compare(value)? < 0.0),
            "<=" | "lte" | "$lte" => Ok(self.compare(value)? <= 0.0),
            other => Err(TransitError::Function(format!("unknown operator, {}", other))),
        }
    }

    /// `value - match`, both coerced to floats.
    fn compare(&self, value: &Value) -> Result<f64> {
        Ok(to_float(value)? - to_float(&self.r#match)?)
    }
}

fn to_float(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| wrong_type(value)),
        Value::String(s) => s.parse().map_err(|_| wrong_type(value)),
        _ => Err(wrong_type(value)),
    }
}

fn wrong_type(value: &Value) -> TransitError {
    let got = match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    TransitError::Function(format!(
        "value is of incompatible type, wanted number or string, got {}",
        got
    ))
}

impl TryFrom<SkipConfig> for Skip {
    type Error = TransitError;

    fn try_from(conf: SkipConfig) -> Result<Self> {
        Skip::new(conf.field, conf.operator, conf.r#match)
    }
}

impl Function for Skip {
    fn name(&self) -> &str {
        "skip"
    }

    fn apply(&self, record: Record) -> Result<Option<Record>> {
        if self.keep(record.document.get(&self.field))? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }
}
