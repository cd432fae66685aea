use std::sync::Arc;

use tracing::debug;

use super::{events::BatchEvent, states::BatchStatus};
use crate::error::{BatchError, Result};
use crate::models::TransitionDetails;
use crate::store::BatchStateStore;

/// Status transitions for one batch, applied as compare-and-set against the state store
pub struct BatchStateMachine {
    batch_id: String,
    store: Arc<dyn BatchStateStore>,
}

impl BatchStateMachine {
    pub fn new(batch_id: impl Into<String>, store: Arc<dyn BatchStateStore>) -> Self {
        Self {
            batch_id: batch_id.into(),
            store,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Get the current status of the batch from the store
    pub async fn current_state(&self) -> Result<BatchStatus> {
        self.store
            .fetch_batch(&self.batch_id)
            .await?
            .map(|record| record.status)
            .ok_or_else(|| BatchError::unknown_batch(&self.batch_id))
    }

    /// Determine the target status for an event applied in `current`
    pub fn determine_target_state(
        &self,
        current: BatchStatus,
        event: &BatchEvent,
    ) -> Result<BatchStatus> {
        let target = match (current, event) {
            (BatchStatus::Open, BatchEvent::AllUnitsReported) => BatchStatus::Complete,
            (BatchStatus::Complete, BatchEvent::BeginConsolidation) => BatchStatus::Consolidating,
            (BatchStatus::Consolidating, BatchEvent::MergeVerified { .. }) => {
                BatchStatus::Consolidated
            }
            (BatchStatus::Consolidating, BatchEvent::Fail(_)) => BatchStatus::Failed,
            (from_state, _) => {
                return Err(BatchError::InvalidTransition {
                    batch_id: self.batch_id.clone(),
                    from: from_state.to_string(),
                    to: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Apply `event` from its source status.
    ///
    /// Returns `Ok(true)` for the single caller whose compare-and-set succeeded and
    /// `Ok(false)` for every caller that lost the race or found the batch elsewhere.
    pub async fn transition(&self, event: &BatchEvent) -> Result<bool> {
        let from = event.source_state();
        let to = self.determine_target_state(from, event)?;

        let details = match event {
            BatchEvent::MergeVerified { rows_merged } => {
                TransitionDetails::consolidated(*rows_merged)
            }
            BatchEvent::Fail(reason) => TransitionDetails::failed(reason.clone()),
            _ => TransitionDetails::default(),
        };

        let won = self
            .store
            .compare_and_set_status(&self.batch_id, from, to, &details)
            .await?;

        debug!(
            batch_id = %self.batch_id,
            event = event.event_type(),
            from = %from,
            to = %to,
            won,
            "Batch transition evaluated"
        );

        Ok(won)
    }
}
