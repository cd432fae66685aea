use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work handed to an external worker when a batch starts
///
/// `unit_id` is the identity the worker reports back with on completion; `payload`
/// is opaque to the coordinator and only travels to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitSpec {
    pub unit_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl WorkUnitSpec {
    pub fn new(unit_id: impl Into<String>, payload: Value) -> Self {
        Self {
            unit_id: unit_id.into(),
            payload,
        }
    }

    /// Unit spec with no payload
    pub fn bare(unit_id: impl Into<String>) -> Self {
        Self::new(unit_id, Value::Null)
    }
}
