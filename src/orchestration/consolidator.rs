//! # Consolidator
//!
//! Folds every staged unit of a `CONSOLIDATING` batch into the canonical store.
//!
//! ## Pipeline
//!
//! 1. Enumerate staged units. None at all, or a completed unit without one, is a
//!    data-loss condition (`NoStagedData`).
//! 2. Collapse rows by business key: units in `unit_id` order, last row wins. The
//!    staged row count must cover the reported output count within tolerance.
//! 3. One upsert-merge of all rows into the canonical store.
//! 4. Verify the affected count against the distinct key count (within tolerance),
//!    then read the keys back from the canonical store.
//! 5. Record `rows_merged` on the batch, and only then delete the staged units and
//!    move the batch to `CONSOLIDATED`.
//!
//! The run refreshes the batch's `updated_at` before merging and again when it
//! records the verified merge, so the recovery sweep does not take over live work. A
//! run that finds no staged units but a recorded `rows_merged` resumes at cleanup.
//!
//! Data-integrity failures move the batch to `FAILED` and leave staged units intact.
//! Transient store failures are retried and, if they persist, surface with the batch
//! still `CONSOLIDATING` so the recovery sweep can re-run it; every step is idempotent.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::types::ConsolidationResult;
use crate::config::ConsolidationConfig;
use crate::constants::events;
use crate::error::{BatchError, Result};
use crate::events::EventPublisher;
use crate::logging::{log_batch_operation, log_error};
use crate::models::{BatchRecord, BusinessKey, StagedRow, StagedUnit};
use crate::resilience::RetryPolicy;
use crate::state_machine::{BatchEvent, BatchStateMachine, BatchStatus};
use crate::store::{BatchStateStore, CanonicalStore, StagingStore};

/// Staged rows collapsed to one row per business key
#[derive(Debug, Default)]
struct MergePlan {
    rows: Vec<StagedRow>,
    keys: Vec<BusinessKey>,
    staged_rows: u64,
}

pub struct Consolidator {
    state_store: Arc<dyn BatchStateStore>,
    staging: Arc<dyn StagingStore>,
    canonical: Arc<dyn CanonicalStore>,
    retry: RetryPolicy,
    key_columns: Vec<String>,
    merge_tolerance: f64,
    publisher: EventPublisher,
}

impl Consolidator {
    pub fn new(
        state_store: Arc<dyn BatchStateStore>,
        staging: Arc<dyn StagingStore>,
        canonical: Arc<dyn CanonicalStore>,
        retry: RetryPolicy,
        config: &ConsolidationConfig,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            state_store,
            staging,
            canonical,
            retry,
            key_columns: config.key_columns.clone(),
            merge_tolerance: config.merge_tolerance,
            publisher,
        }
    }

    /// Run the consolidation pipeline for a batch already claimed as `CONSOLIDATING`.
    ///
    /// On a `CONSOLIDATED` batch this only re-merges and cleans up leftover staged
    /// units; the status and `rows_merged` are left alone.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn consolidate(&self, batch_id: &str) -> Result<ConsolidationResult> {
        let record = self
            .retry
            .run("fetch_batch", || self.state_store.fetch_batch(batch_id))
            .await?
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        match record.status {
            BatchStatus::Consolidating => self.run_pipeline(&record).await,
            BatchStatus::Consolidated => self.reconcile_consolidated(&record).await,
            other => Err(BatchError::InvalidTransition {
                batch_id: batch_id.to_string(),
                from: other.to_string(),
                to: BatchStatus::Consolidated.to_string(),
            }),
        }
    }

    async fn run_pipeline(&self, record: &BatchRecord) -> Result<ConsolidationResult> {
        let batch_id = record.batch_id.as_str();

        let units = self
            .retry
            .run("list_staged_units", || self.staging.list_staged_units(batch_id))
            .await?;

        if units.is_empty() {
            if let Some(rows_merged) = record.rows_merged {
                // An earlier run verified its merge and cleaned up before it could finish
                info!(rows_merged, "Merge already verified; completing consolidation");
                return self.finish(batch_id, rows_merged, 0, 0).await;
            }
            return Err(self
                .fail_batch(
                    batch_id,
                    BatchError::NoStagedData {
                        batch_id: batch_id.to_string(),
                        detail: format!(
                            "zero staged units for a batch of {} completed units",
                            record.completed_count()
                        ),
                    },
                )
                .await);
        }

        if let Err(e) = check_unit_coverage(record, &units) {
            return Err(self.fail_batch(batch_id, e).await);
        }

        let plan = match self
            .plan_merge(batch_id, units)
            .and_then(|plan| self.check_staged_rows(record, plan))
        {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail_batch(batch_id, e).await),
        };

        if !self
            .retry
            .run("heartbeat", || {
                self.state_store
                    .heartbeat(batch_id, BatchStatus::Consolidating)
            })
            .await?
        {
            return self.yield_to_concurrent_run(batch_id).await;
        }

        let rows_merged = if plan.keys.is_empty() {
            0
        } else {
            match self.merge_and_verify(batch_id, &plan).await {
                Ok(affected) => affected,
                Err(e) if e.is_data_integrity() => return Err(self.fail_batch(batch_id, e).await),
                Err(e) => return Err(e),
            }
        };

        // Staged units may only disappear once the verified merge is on the record
        if !self
            .retry
            .run("record_merge_verified", || {
                self.state_store.record_merge_verified(batch_id, rows_merged)
            })
            .await?
        {
            return self.yield_to_concurrent_run(batch_id).await;
        }

        self.finish(batch_id, rows_merged, plan.staged_rows, plan.keys.len() as u64)
            .await
    }

    /// Delete staged units and move the batch to `CONSOLIDATED`
    async fn finish(
        &self,
        batch_id: &str,
        rows_merged: u64,
        staged_rows: u64,
        distinct_keys: u64,
    ) -> Result<ConsolidationResult> {
        let units_cleaned = self
            .retry
            .run("delete_staged_units", || self.staging.delete_staged_units(batch_id))
            .await?;

        let machine = BatchStateMachine::new(batch_id, self.state_store.clone());
        let verified = BatchEvent::MergeVerified { rows_merged };
        let won = self
            .retry
            .run("mark_consolidated", || machine.transition(&verified))
            .await?;

        let mut result = ConsolidationResult {
            batch_id: batch_id.to_string(),
            rows_merged,
            units_cleaned,
            staged_rows,
            distinct_keys,
            already_consolidated: false,
        };

        if !won {
            // A concurrent run may have finished first; anything else is a real conflict
            let current = machine.current_state().await?;
            if current != BatchStatus::Consolidated {
                return Err(BatchError::InvalidTransition {
                    batch_id: batch_id.to_string(),
                    from: current.to_string(),
                    to: BatchStatus::Consolidated.to_string(),
                });
            }
            info!("Another run completed consolidation first");
            result.already_consolidated = true;
            return Ok(result);
        }

        log_batch_operation(
            "consolidate",
            batch_id,
            None,
            BatchStatus::Consolidated.as_str(),
            Some(&format!(
                "rows_merged={rows_merged} units_cleaned={units_cleaned} staged_rows={staged_rows} distinct_keys={distinct_keys}"
            )),
        );
        self.publisher.publish(
            events::BATCH_CONSOLIDATED,
            batch_id,
            json!({ "rows_merged": rows_merged, "units_cleaned": units_cleaned }),
        );

        Ok(result)
    }

    /// The batch left `CONSOLIDATING` under this run; defer to whoever moved it
    async fn yield_to_concurrent_run(&self, batch_id: &str) -> Result<ConsolidationResult> {
        let record = self
            .retry
            .run("fetch_batch", || self.state_store.fetch_batch(batch_id))
            .await?
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        warn!(status = %record.status, "Batch moved on during consolidation");
        match record.status {
            BatchStatus::Consolidated => self.reconcile_consolidated(&record).await,
            other => Err(BatchError::InvalidTransition {
                batch_id: batch_id.to_string(),
                from: other.to_string(),
                to: BatchStatus::Consolidated.to_string(),
            }),
        }
    }

    /// Staged rows must account for what workers reported, within the merge tolerance
    fn check_staged_rows(&self, record: &BatchRecord, plan: MergePlan) -> Result<MergePlan> {
        let reported = record.total_output_count;
        if reported == 0 {
            return Ok(plan);
        }
        if plan.staged_rows == 0 {
            return Err(BatchError::NoStagedData {
                batch_id: record.batch_id.clone(),
                detail: format!("staged units hold zero rows but workers reported {reported} outputs"),
            });
        }

        let minimum = minimum_affected(reported, self.merge_tolerance);
        if plan.staged_rows < minimum {
            return Err(BatchError::MergeVerification {
                batch_id: record.batch_id.clone(),
                expected: minimum,
                observed: plan.staged_rows,
                detail: format!(
                    "{} staged rows for {reported} reported outputs",
                    plan.staged_rows
                ),
            });
        }
        Ok(plan)
    }

    /// Re-apply leftover staged units of an already consolidated batch
    async fn reconcile_consolidated(&self, record: &BatchRecord) -> Result<ConsolidationResult> {
        let batch_id = record.batch_id.as_str();
        let mut result = ConsolidationResult::empty(batch_id);
        result.already_consolidated = true;
        result.rows_merged = record.rows_merged.unwrap_or_default();

        let units = self
            .retry
            .run("list_staged_units", || self.staging.list_staged_units(batch_id))
            .await?;
        if units.is_empty() {
            return Ok(result);
        }

        warn!(
            units = units.len(),
            "Consolidated batch still has staged units; re-merging before cleanup"
        );

        // The batch is terminal, so integrity problems are surfaced without a transition
        let plan = self.plan_merge(batch_id, units)?;
        if !plan.keys.is_empty() {
            self.merge_and_verify(batch_id, &plan).await?;
        }

        result.units_cleaned = self
            .retry
            .run("delete_staged_units", || self.staging.delete_staged_units(batch_id))
            .await?;
        result.staged_rows = plan.staged_rows;
        result.distinct_keys = plan.keys.len() as u64;
        Ok(result)
    }

    /// Collapse staged rows by business key, units in `unit_id` order, last row wins
    fn plan_merge(&self, batch_id: &str, mut units: Vec<StagedUnit>) -> Result<MergePlan> {
        units.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));

        let mut staged_rows = 0_u64;
        let mut by_key: BTreeMap<BusinessKey, StagedRow> = BTreeMap::new();
        for unit in units {
            for row in unit.rows {
                staged_rows += 1;
                let key = row.business_key(&self.key_columns).map_err(|e| {
                    BatchError::InvalidStagedData {
                        batch_id: batch_id.to_string(),
                        message: format!("unit {}: {e}", unit.unit_id),
                    }
                })?;
                by_key.insert(key, row);
            }
        }

        let (keys, rows) = by_key.into_iter().unzip();
        Ok(MergePlan {
            rows,
            keys,
            staged_rows,
        })
    }

    /// Merge the plan and check both the reported and the read-back effect
    async fn merge_and_verify(&self, batch_id: &str, plan: &MergePlan) -> Result<u64> {
        let distinct = plan.keys.len() as u64;

        let affected = self
            .retry
            .run("upsert_merge", || {
                self.canonical
                    .upsert_merge(batch_id, &plan.rows, &self.key_columns)
            })
            .await?;

        let minimum = minimum_affected(distinct, self.merge_tolerance);
        if affected < minimum {
            return Err(BatchError::MergeVerification {
                batch_id: batch_id.to_string(),
                expected: minimum,
                observed: affected,
                detail: format!("merge affected {affected} rows for {distinct} distinct keys"),
            });
        }

        let present = self
            .retry
            .run("count_present", || self.canonical.count_present(&plan.keys))
            .await?;
        if present < distinct {
            return Err(BatchError::MergeVerification {
                batch_id: batch_id.to_string(),
                expected: distinct,
                observed: present,
                detail: "merged keys missing from canonical store on read-back".to_string(),
            });
        }

        info!(affected, distinct, present, "Merge verified");
        Ok(affected)
    }

    /// Move the batch to FAILED with the error as reason, returning the original error.
    ///
    /// Staged units are never touched here.
    pub async fn fail_batch(&self, batch_id: &str, error: BatchError) -> BatchError {
        let reason = format!("{}: {error}", error.error_code());
        log_error("consolidator", "consolidate", &reason, Some(batch_id));

        let machine = BatchStateMachine::new(batch_id, self.state_store.clone());
        let fail = BatchEvent::fail_with_error(reason.clone());
        match self
            .retry
            .run("mark_failed", || machine.transition(&fail))
            .await
        {
            Ok(true) => {
                log_batch_operation(
                    "consolidate",
                    batch_id,
                    None,
                    BatchStatus::Failed.as_str(),
                    Some(&reason),
                );
                self.publisher.publish(
                    events::BATCH_FAILED,
                    batch_id,
                    json!({ "reason": reason, "error_code": error.error_code() }),
                );
            }
            Ok(false) => warn!(batch_id, "Batch left CONSOLIDATING before it could be failed"),
            Err(e) => log_error("consolidator", "mark_failed", &e.to_string(), Some(batch_id)),
        }

        error
    }
}

/// Every completed unit must have staged its output, even an empty one
fn check_unit_coverage(record: &BatchRecord, units: &[StagedUnit]) -> Result<()> {
    let staged: BTreeSet<&str> = units.iter().map(|u| u.unit_id.as_str()).collect();
    let missing: Vec<&str> = record
        .completed_unit_ids
        .iter()
        .map(String::as_str)
        .filter(|id| !staged.contains(id))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }
    Err(BatchError::NoStagedData {
        batch_id: record.batch_id.clone(),
        detail: format!(
            "{} of {} completed units have no staged output: {}",
            missing.len(),
            record.completed_count(),
            missing.join(", ")
        ),
    })
}

/// `ceil(distinct * (1 - tolerance))`, and never less than one row for non-empty input
fn minimum_affected(distinct: u64, tolerance: f64) -> u64 {
    if distinct == 0 {
        return 0;
    }
    let allowed = (distinct as f64 * (1.0 - tolerance.clamp(0.0, 1.0))).ceil() as u64;
    allowed.clamp(1, distinct)
}
