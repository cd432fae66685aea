//! # Notification Service
//!
//! Sends the "batch consolidated" notification and records delivery on the batch record.
//! Delivery is at-least-once: the notification goes out before `notified_at` is set, so
//! a crash in between leads to a re-send from the recovery sweep.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{BatchError, Result};
use crate::events::{BatchConsolidatedEvent, BatchNotifier};
use crate::logging::log_batch_operation;
use crate::resilience::RetryPolicy;
use crate::store::BatchStateStore;

pub struct NotificationService {
    store: Arc<dyn BatchStateStore>,
    notifier: Arc<dyn BatchNotifier>,
    retry: RetryPolicy,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn BatchStateStore>,
        notifier: Arc<dyn BatchNotifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            retry,
        }
    }

    /// Notify for a consolidated batch that has no recorded delivery yet.
    ///
    /// Returns `Ok(false)` when there was nothing to send.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn notify_if_pending(&self, batch_id: &str) -> Result<bool> {
        let record = self
            .retry
            .run("fetch_batch", || self.store.fetch_batch(batch_id))
            .await?
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        if !record.needs_notification() {
            debug!(status = %record.status, "No notification pending");
            return Ok(false);
        }

        let event = BatchConsolidatedEvent::new(batch_id, record.rows_merged.unwrap_or_default());
        self.retry
            .run("notify_consolidated", || self.notifier.notify_consolidated(&event))
            .await?;

        let recorded = self
            .retry
            .run("mark_notified", || self.store.mark_notified(batch_id))
            .await?;

        log_batch_operation(
            "notify_consolidated",
            batch_id,
            None,
            record.status.as_str(),
            Some(&format!("rows_merged={} recorded={recorded}", event.rows_merged)),
        );
        Ok(true)
    }
}
