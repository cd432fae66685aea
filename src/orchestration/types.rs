//! # Orchestration Types
//!
//! Results returned by the batch coordination components.

use serde::{Deserialize, Serialize};

use crate::store::CompletionApplied;

/// Outcome of one completion report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionOutcome {
    /// Every expected unit has reported, whoever won the completion transition
    pub batch_is_complete: bool,
    /// This report won both transitions and handed the batch to consolidation
    pub consolidation_triggered: bool,
    pub applied: CompletionApplied,
}

/// Result of a consolidation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationResult {
    pub batch_id: String,
    /// Affected-row count reported by the canonical store
    pub rows_merged: u64,
    /// Staged units deleted after verification
    pub units_cleaned: u64,
    /// Rows read from staging before de-duplication
    pub staged_rows: u64,
    /// Distinct business keys merged
    pub distinct_keys: u64,
    /// The batch was already `CONSOLIDATED` before this run
    pub already_consolidated: bool,
}

impl ConsolidationResult {
    pub(crate) fn empty(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            rows_merged: 0,
            units_cleaned: 0,
            staged_rows: 0,
            distinct_keys: 0,
            already_consolidated: false,
        }
    }
}

/// What one recovery sweep pass found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Batches whose consolidation was resumed by this pass
    pub resumed: Vec<String>,
    /// Consolidated batches whose notification was re-sent
    pub renotified: Vec<String>,
    /// OPEN batches older than the alert threshold; reported only
    pub stuck_open: Vec<String>,
    /// Batches the pass could not recover, with the error it hit
    pub failures: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty()
            && self.renotified.is_empty()
            && self.stuck_open.is_empty()
            && self.failures.is_empty()
    }
}
