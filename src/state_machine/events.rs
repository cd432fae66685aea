use serde::{Deserialize, Serialize};

use super::states::BatchStatus;

/// Events that can trigger batch status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BatchEvent {
    /// Every expected unit has reported completion
    AllUnitsReported,
    /// A caller claims the right to run consolidation
    BeginConsolidation,
    /// Merge verified and staged units removed
    MergeVerified { rows_merged: u64 },
    /// Data-integrity failure during consolidation
    Fail(String),
}

impl BatchEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AllUnitsReported => "all_units_reported",
            Self::BeginConsolidation => "begin_consolidation",
            Self::MergeVerified { .. } => "merge_verified",
            Self::Fail(_) => "fail",
        }
    }

    /// The only status this event may be applied from
    pub fn source_state(&self) -> BatchStatus {
        match self {
            Self::AllUnitsReported => BatchStatus::Open,
            Self::BeginConsolidation => BatchStatus::Complete,
            Self::MergeVerified { .. } | Self::Fail(_) => BatchStatus::Consolidating,
        }
    }

    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
