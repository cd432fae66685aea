//! # Completion Tracker
//!
//! Applies worker completion reports to the batch record and detects completion.
//!
//! A report is one atomic store operation (set-union of the unit id, gated increment of
//! the output count) followed by one fresh read. If the read shows every expected unit,
//! the tracker races for `OPEN -> COMPLETE`; the single winner immediately claims
//! `COMPLETE -> CONSOLIDATING` and hands the batch to the [`ConsolidationTrigger`].
//! Nothing about batch progress is held in process memory between calls.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::types::CompletionOutcome;
use crate::constants::events;
use crate::error::{BatchError, Result};
use crate::events::EventPublisher;
use crate::logging::{log_batch_operation, log_error};
use crate::resilience::RetryPolicy;
use crate::state_machine::{BatchEvent, BatchStateMachine, BatchStatus};
use crate::store::{BatchStateStore, CompletionApplied};

/// Receives a batch that has just been claimed for consolidation (`CONSOLIDATING`)
#[async_trait]
pub trait ConsolidationTrigger: Send + Sync {
    async fn trigger(&self, batch_id: &str) -> Result<()>;
}

pub struct CompletionTracker {
    store: Arc<dyn BatchStateStore>,
    retry: RetryPolicy,
    publisher: EventPublisher,
    trigger: Arc<dyn ConsolidationTrigger>,
}

impl CompletionTracker {
    pub fn new(
        store: Arc<dyn BatchStateStore>,
        retry: RetryPolicy,
        publisher: EventPublisher,
        trigger: Arc<dyn ConsolidationTrigger>,
    ) -> Self {
        Self {
            store,
            retry,
            publisher,
            trigger,
        }
    }

    /// Record that `unit_id` finished with `output_count` outputs.
    ///
    /// Safe to call any number of times per unit. Consolidation failures after a
    /// successful hand-off are logged and reflected in the batch status, not returned.
    #[instrument(skip(self), fields(batch_id = %batch_id, unit_id = %unit_id))]
    pub async fn report_completion(
        &self,
        batch_id: &str,
        unit_id: &str,
        output_count: u64,
    ) -> Result<CompletionOutcome> {
        if unit_id.trim().is_empty() {
            return Err(BatchError::validation("unit_id must not be empty"));
        }

        let applied = self
            .retry
            .run("record_unit_completion", || {
                self.store
                    .record_unit_completion(batch_id, unit_id, output_count)
            })
            .await?;

        match applied {
            CompletionApplied::CapacityExceeded => {
                return Err(BatchError::validation(format!(
                    "batch {batch_id} already holds every expected unit; rejecting unknown unit {unit_id}"
                )));
            }
            CompletionApplied::Recorded => {
                self.publisher.publish(
                    events::BATCH_UNIT_COMPLETED,
                    batch_id,
                    json!({ "unit_id": unit_id, "output_count": output_count }),
                );
            }
            CompletionApplied::AlreadyRecorded => {
                debug!("Duplicate completion report ignored");
            }
        }

        let record = self
            .retry
            .run("fetch_batch", || self.store.fetch_batch(batch_id))
            .await?
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        if !record.all_units_reported() {
            return Ok(CompletionOutcome {
                batch_is_complete: false,
                consolidation_triggered: false,
                applied,
            });
        }

        let consolidation_triggered = if record.status == BatchStatus::Open {
            self.claim_and_trigger(batch_id, unit_id, record.completed_count())
                .await?
        } else {
            false
        };

        Ok(CompletionOutcome {
            batch_is_complete: true,
            consolidation_triggered,
            applied,
        })
    }

    /// Race for both single-winner transitions; only the winner triggers consolidation
    async fn claim_and_trigger(
        &self,
        batch_id: &str,
        unit_id: &str,
        completed: usize,
    ) -> Result<bool> {
        let machine = BatchStateMachine::new(batch_id, self.store.clone());

        let complete = BatchEvent::AllUnitsReported;
        let completed_won = self
            .retry
            .run("complete_batch", || machine.transition(&complete))
            .await?;
        if !completed_won {
            return Ok(false);
        }

        log_batch_operation(
            "batch_completed",
            batch_id,
            Some(unit_id),
            BatchStatus::Complete.as_str(),
            Some(&format!("completed_units={completed}")),
        );
        self.publisher.publish(
            events::BATCH_COMPLETED,
            batch_id,
            json!({ "completed_units": completed }),
        );

        let begin = BatchEvent::BeginConsolidation;
        let claimed = self
            .retry
            .run("claim_consolidation", || machine.transition(&begin))
            .await?;
        if !claimed {
            // Recovery got there first
            return Ok(false);
        }

        self.publisher
            .publish(events::BATCH_CONSOLIDATION_STARTED, batch_id, json!({}));

        if let Err(e) = self.trigger.trigger(batch_id).await {
            log_error(
                "completion_tracker",
                "trigger_consolidation",
                &e.to_string(),
                Some(batch_id),
            );
        }
        Ok(true)
    }
}
