use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::state_machine::BatchStatus;

/// BatchRecord is the durable progress document for one fan-out/fan-in batch
/// Maps to `tasker_batches` table
///
/// Mutated only through the atomic operations of
/// [`BatchStateStore`](crate::store::BatchStateStore): set-union of unit ids, numeric
/// increment of the output count, and compare-and-set of the status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub expected_unit_count: u32,
    pub completed_unit_ids: BTreeSet<String>,
    pub total_output_count: u64,
    pub status: BatchStatus,
    /// Set together with the FAILED transition
    pub failure_reason: Option<String>,
    /// Recorded once the merge is verified, while still CONSOLIDATING
    pub rows_merged: Option<u64>,
    /// Set once the consolidated notification has been delivered
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRecord {
    /// Fresh OPEN record with no reported units
    pub fn new(batch_id: impl Into<String>, expected_unit_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch_id.into(),
            expected_unit_count,
            completed_unit_ids: BTreeSet::new(),
            total_output_count: 0,
            status: BatchStatus::Open,
            failure_reason: None,
            rows_merged: None,
            notified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.completed_unit_ids.len()
    }

    /// True once every expected unit has reported; output counts play no part
    pub fn all_units_reported(&self) -> bool {
        self.completed_count() >= self.expected_unit_count as usize
    }

    pub fn has_unit(&self, unit_id: &str) -> bool {
        self.completed_unit_ids.contains(unit_id)
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.expected_unit_count == 0 {
            return 100.0;
        }
        (self.completed_count() as f64 / f64::from(self.expected_unit_count)) * 100.0
    }

    pub fn needs_notification(&self) -> bool {
        self.status == BatchStatus::Consolidated && self.notified_at.is_none()
    }
}

/// Audit fields written atomically alongside a status compare-and-set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionDetails {
    pub failure_reason: Option<String>,
    pub rows_merged: Option<u64>,
}

impl TransitionDetails {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            rows_merged: None,
        }
    }

    pub fn consolidated(rows_merged: u64) -> Self {
        Self {
            failure_reason: None,
            rows_merged: Some(rows_merged),
        }
    }
}
