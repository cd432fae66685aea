use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch status definitions
///
/// `OPEN -> COMPLETE -> CONSOLIDATING -> CONSOLIDATED`, with `CONSOLIDATING -> FAILED`
/// on data-integrity failures. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Accepting completion reports
    Open,
    /// Every expected unit reported; waiting for consolidation to be claimed
    Complete,
    /// A single consolidator owns the merge
    Consolidating,
    /// Merge verified and staged units cleaned up
    Consolidated,
    /// Data-integrity failure; staged units preserved for manual remediation
    Failed,
}

impl BatchStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Consolidated | Self::Failed)
    }

    /// True once the batch has stopped accepting new units
    pub fn is_complete_or_later(&self) -> bool {
        !matches!(self, Self::Open)
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Complete)
                | (Self::Complete, Self::Consolidating)
                | (Self::Consolidating, Self::Consolidated)
                | (Self::Consolidating, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Complete => "COMPLETE",
            Self::Consolidating => "CONSOLIDATING",
            Self::Consolidated => "CONSOLIDATED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "COMPLETE" => Ok(Self::Complete),
            "CONSOLIDATING" => Ok(Self::Consolidating),
            "CONSOLIDATED" => Ok(Self::Consolidated),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

/// Default status for new batches
impl Default for BatchStatus {
    fn default() -> Self {
        Self::Open
    }
}
