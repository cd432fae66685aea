//! # Store Interfaces
//!
//! The coordinator talks to three stores:
//!
//! - [`BatchStateStore`]: the single source of truth for batch progress. Every mutation
//!   is expressed as an operation the store applies atomically without a client-side
//!   read: set-union of a unit id (gated so the output increment happens once per unit),
//!   compare-and-set of the status, and conditional timestamp claims.
//! - [`StagingStore`]: one staged output per `(batch_id, unit_id)`, written by workers,
//!   read and deleted by the consolidator.
//! - [`CanonicalStore`]: the final dataset, merged by business key with upsert semantics.
//!
//! Two adapter families are provided: [`memory`] (process-local, for tests and embedded
//! use) and [`postgres`] (sqlx).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{BatchError, Result};
use crate::models::{BatchRecord, BusinessKey, StagedRow, StagedUnit, TransitionDetails};
use crate::state_machine::BatchStatus;

pub use memory::{InMemoryBatchStateStore, InMemoryCanonicalStore, InMemoryStagingStore};
pub use postgres::{PgBatchStateStore, PgCanonicalStore, PgStagingStore};

/// Outcome of applying one completion report to a batch record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionApplied {
    /// Unit id newly added; output count incremented
    Recorded,
    /// Unit id was already present; nothing changed
    AlreadyRecorded,
    /// Unit id is new but the batch already holds every expected unit
    CapacityExceeded,
}

/// Selection criteria for sweeping batch records
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFilter {
    pub status: BatchStatus,
    /// Only records whose `updated_at` is at or before this instant
    pub updated_before: Option<DateTime<Utc>>,
    /// Only records that have not yet had their notification recorded
    pub unnotified_only: bool,
    pub limit: i64,
}

impl BatchFilter {
    pub fn status(status: BatchStatus) -> Self {
        Self {
            status,
            updated_before: None,
            unnotified_only: false,
            limit: 100,
        }
    }

    pub fn updated_before(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_before = Some(instant);
        self
    }

    pub fn unnotified_only(mut self) -> Self {
        self.unnotified_only = true;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, record: &BatchRecord) -> bool {
        record.status == self.status
            && self
                .updated_before
                .map_or(true, |cutoff| record.updated_at <= cutoff)
            && (!self.unnotified_only || record.notified_at.is_none())
    }
}

/// Durable keyed-document store holding one [`BatchRecord`] per batch
#[async_trait]
pub trait BatchStateStore: Send + Sync {
    /// Create a new OPEN record; fails with `Validation` if the id is taken
    async fn create_batch(&self, batch_id: &str, expected_unit_count: u32) -> Result<BatchRecord>;

    async fn fetch_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>>;

    /// Set-union `unit_id` into `completed_unit_ids` and, only if it was newly added,
    /// increment `total_output_count` by `output_count`, as one atomic operation
    async fn record_unit_completion(
        &self,
        batch_id: &str,
        unit_id: &str,
        output_count: u64,
    ) -> Result<CompletionApplied>;

    /// Move `status` from `expected` to `next`; `Ok(false)` when another caller won
    async fn compare_and_set_status(
        &self,
        batch_id: &str,
        expected: BatchStatus,
        next: BatchStatus,
        details: &TransitionDetails,
    ) -> Result<bool>;

    /// Refresh `updated_at` if the batch is still in `status` and not touched since
    /// `stale_before`; used by the recovery sweep to take over abandoned work
    async fn claim_stale(
        &self,
        batch_id: &str,
        status: BatchStatus,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Refresh `updated_at` while the batch is still in `status`.
    ///
    /// Long-running work calls this so the recovery sweep keeps treating it as live;
    /// `Ok(false)` means the batch has moved on and the caller no longer owns it.
    async fn heartbeat(&self, batch_id: &str, status: BatchStatus) -> Result<bool>;

    /// Persist `rows_merged` on a `CONSOLIDATING` batch once its merge has been
    /// verified, before staged units are deleted. `Ok(false)` if no longer consolidating.
    async fn record_merge_verified(&self, batch_id: &str, rows_merged: u64) -> Result<bool>;

    /// Record notification delivery once; `Ok(false)` if already recorded
    async fn mark_notified(&self, batch_id: &str) -> Result<bool>;

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchRecord>>;
}

/// Per-worker staged outputs awaiting consolidation
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Worker-side write; re-staging the same unit replaces its rows
    async fn stage_unit(&self, unit: StagedUnit) -> Result<()>;

    /// All staged units of a batch, ordered by `unit_id`
    async fn list_staged_units(&self, batch_id: &str) -> Result<Vec<StagedUnit>>;

    /// Remove every staged unit of a batch, returning how many were removed
    async fn delete_staged_units(&self, batch_id: &str) -> Result<u64>;
}

/// Canonical dataset merged by business key
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Insert-or-update every row in one atomic operation, returning affected rows.
    /// Rows must carry distinct business keys.
    async fn upsert_merge(
        &self,
        batch_id: &str,
        rows: &[StagedRow],
        key_columns: &[String],
    ) -> Result<u64>;

    /// Number of the given keys currently present
    async fn count_present(&self, keys: &[BusinessKey]) -> Result<u64>;

    async fn row_count(&self) -> Result<u64>;
}

/// Shared guard so adapters refuse transitions the state machine does not allow
pub(crate) fn ensure_legal_transition(
    batch_id: &str,
    expected: BatchStatus,
    next: BatchStatus,
) -> Result<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(BatchError::InvalidTransition {
            batch_id: batch_id.to_string(),
            from: expected.to_string(),
            to: next.to_string(),
        })
    }
}

/// Encode rows for a merge, rejecting missing key columns and duplicate keys
pub(crate) fn keyed_rows<'a>(
    batch_id: &str,
    rows: &'a [StagedRow],
    key_columns: &[String],
) -> Result<Vec<(BusinessKey, &'a StagedRow)>> {
    let mut seen = std::collections::HashSet::with_capacity(rows.len());
    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows {
        let key = row.business_key(key_columns)?;
        if !seen.insert(key.clone()) {
            return Err(BatchError::InvalidStagedData {
                batch_id: batch_id.to_string(),
                message: format!("duplicate business key {key} in merge input"),
            });
        }
        keyed.push((key, row));
    }
    Ok(keyed)
}
