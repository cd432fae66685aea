//! # Batch Initiator
//!
//! Registers a batch in the state store before any of its work units can be dispatched,
//! so a completion report can never race ahead of batch registration.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::constants::events;
use crate::error::{BatchError, Result};
use crate::events::EventPublisher;
use crate::logging::{log_batch_operation, log_error};
use crate::models::{BatchRecord, WorkUnitSpec};
use crate::state_machine::BatchStatus;
use crate::store::BatchStateStore;

/// Transport that delivers work units to workers
#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    async fn dispatch(&self, batch_id: &str, units: &[WorkUnitSpec]) -> Result<()>;
}

pub struct BatchInitiator {
    store: Arc<dyn BatchStateStore>,
    publisher: EventPublisher,
}

impl BatchInitiator {
    pub fn new(store: Arc<dyn BatchStateStore>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    /// Create an OPEN batch under a fresh id and return the id
    pub async fn start_batch(&self, work_units: &[WorkUnitSpec]) -> Result<String> {
        let batch_id = Uuid::new_v4().to_string();
        self.start_batch_with_id(&batch_id, work_units).await?;
        Ok(batch_id)
    }

    /// Create an OPEN batch under a caller-chosen id.
    ///
    /// Creation is not retried: after a lost acknowledgement a retry cannot tell the
    /// caller's own write apart from an id collision.
    #[instrument(skip(self, work_units), fields(unit_count = work_units.len()))]
    pub async fn start_batch_with_id(
        &self,
        batch_id: &str,
        work_units: &[WorkUnitSpec],
    ) -> Result<BatchRecord> {
        if batch_id.trim().is_empty() {
            return Err(BatchError::validation("batch_id must not be empty"));
        }
        let expected = validate_work_units(work_units)?;

        let record = self
            .store
            .create_batch(batch_id, expected)
            .await
            .inspect_err(|e| {
                log_error("batch_initiator", "create_batch", &e.to_string(), Some(batch_id));
            })?;

        log_batch_operation(
            "start_batch",
            batch_id,
            None,
            BatchStatus::Open.as_str(),
            Some(&format!("expected_unit_count={expected}")),
        );
        self.publisher.publish(
            events::BATCH_STARTED,
            batch_id,
            json!({ "expected_unit_count": expected }),
        );

        Ok(record)
    }

    /// Persist the batch, then hand its units to `dispatcher`.
    ///
    /// A dispatch failure leaves the OPEN record in place and is reported as
    /// `Dispatch`, naming the batch so the caller can re-dispatch.
    pub async fn start_and_dispatch(
        &self,
        work_units: &[WorkUnitSpec],
        dispatcher: &dyn WorkDispatcher,
    ) -> Result<String> {
        let batch_id = self.start_batch(work_units).await?;

        dispatcher
            .dispatch(&batch_id, work_units)
            .await
            .map_err(|e| {
                log_error("batch_initiator", "dispatch", &e.to_string(), Some(&batch_id));
                BatchError::Dispatch(format!("batch {batch_id}: {e}"))
            })?;

        log_batch_operation(
            "dispatch",
            &batch_id,
            None,
            BatchStatus::Open.as_str(),
            Some(&format!("units={}", work_units.len())),
        );
        Ok(batch_id)
    }
}

/// Non-empty list of non-empty, distinct unit ids; returns the expected unit count
pub(crate) fn validate_work_units(work_units: &[WorkUnitSpec]) -> Result<u32> {
    if work_units.is_empty() {
        return Err(BatchError::validation("work_units must not be empty"));
    }

    let mut seen = HashSet::with_capacity(work_units.len());
    for unit in work_units {
        if unit.unit_id.trim().is_empty() {
            return Err(BatchError::validation("unit_id must not be empty"));
        }
        if !seen.insert(unit.unit_id.as_str()) {
            return Err(BatchError::validation(format!(
                "duplicate unit_id {} in work_units",
                unit.unit_id
            )));
        }
    }

    u32::try_from(work_units.len())
        .map_err(|_| BatchError::validation("too many work units for one batch"))
}
