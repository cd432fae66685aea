use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{BatchError, Result};

/// One worker's staged output, keyed by `(batch_id, unit_id)`
///
/// Written by the worker, read once and deleted by the consolidator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedUnit {
    pub batch_id: String,
    pub unit_id: String,
    pub rows: Vec<StagedRow>,
    pub staged_at: DateTime<Utc>,
}

impl StagedUnit {
    pub fn new(batch_id: impl Into<String>, unit_id: impl Into<String>, rows: Vec<StagedRow>) -> Self {
        Self {
            batch_id: batch_id.into(),
            unit_id: unit_id.into(),
            rows,
            staged_at: Utc::now(),
        }
    }
}

/// A single output row: a flat JSON object carrying the business key columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagedRow(pub Map<String, Value>);

impl StagedRow {
    /// Build a row from a JSON object; anything else is rejected
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(BatchError::validation(format!(
                "staged row must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Extract the business key; every key column must hold a scalar value
    pub fn business_key(&self, key_columns: &[String]) -> Result<BusinessKey> {
        let mut parts = Vec::with_capacity(key_columns.len());
        for column in key_columns {
            let part = match self.0.get(column) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(Value::Null) | None => {
                    return Err(BatchError::validation(format!(
                        "key column '{column}' is missing or null"
                    )))
                }
                Some(other) => {
                    return Err(BatchError::validation(format!(
                        "key column '{column}' must be a scalar, got {other}"
                    )))
                }
            };
            parts.push(part);
        }
        Ok(BusinessKey(parts))
    }
}

/// Stable business key of a canonical record, independent of the batch that wrote it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusinessKey(pub Vec<String>);

impl BusinessKey {
    /// Single-string encoding used as the canonical table's primary key
    pub fn encode(&self) -> String {
        Value::from(self.0.clone()).to_string()
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}
