//! # Recovery Sweep
//!
//! Periodic pass that takes over work abandoned by crashed coordinator processes:
//!
//! - `COMPLETE` batches older than `stale_after`: the completion winner died before
//!   claiming consolidation. The sweep claims `COMPLETE -> CONSOLIDATING` and runs it.
//! - `CONSOLIDATING` batches older than `stale_after`: claimed with a compare-and-set on
//!   `updated_at`, then consolidated again (every step is idempotent).
//! - `CONSOLIDATED` batches without `notified_at`: notification re-sent.
//! - `OPEN` batches older than `open_batch_alert_after`: reported and logged only.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::ConsolidationPipeline;
use super::types::RecoveryReport;
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::logging::log_error;
use crate::models::{BatchRecord, TransitionDetails};
use crate::state_machine::BatchStatus;
use crate::store::{BatchFilter, BatchStateStore};

pub struct RecoverySweep {
    store: Arc<dyn BatchStateStore>,
    pipeline: Arc<ConsolidationPipeline>,
    config: RecoveryConfig,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<dyn BatchStateStore>,
        pipeline: Arc<ConsolidationPipeline>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// One sweep pass. Per-batch failures are collected in the report; only failing
    /// to list candidates aborts the pass.
    pub async fn run_once(&self) -> Result<RecoveryReport> {
        let now = Utc::now();
        let stale_before = now - to_chrono(self.config.stale_after());
        let open_before = now - to_chrono(self.config.open_batch_alert_after());
        let mut report = RecoveryReport::default();

        for record in self
            .candidates(BatchStatus::Complete, stale_before, false)
            .await?
        {
            let claimed = self
                .store
                .compare_and_set_status(
                    &record.batch_id,
                    BatchStatus::Complete,
                    BatchStatus::Consolidating,
                    &TransitionDetails::default(),
                )
                .await;
            self.resume(&record.batch_id, claimed, &mut report).await;
        }

        for record in self
            .candidates(BatchStatus::Consolidating, stale_before, false)
            .await?
        {
            let claimed = self
                .store
                .claim_stale(&record.batch_id, BatchStatus::Consolidating, stale_before)
                .await;
            self.resume(&record.batch_id, claimed, &mut report).await;
        }

        for record in self
            .candidates(BatchStatus::Consolidated, stale_before, true)
            .await?
        {
            let claimed = self
                .store
                .claim_stale(&record.batch_id, BatchStatus::Consolidated, stale_before)
                .await;
            match claimed {
                Ok(true) => {
                    let notified = self
                        .pipeline
                        .notifications()
                        .notify_if_pending(&record.batch_id)
                        .await;
                    match notified {
                        Ok(true) => report.renotified.push(record.batch_id),
                        Ok(false) => {}
                        Err(e) => report.failures.push((record.batch_id, e.to_string())),
                    }
                }
                Ok(false) => debug!(batch_id = %record.batch_id, "Notification claimed elsewhere"),
                Err(e) => report.failures.push((record.batch_id, e.to_string())),
            }
        }

        for record in self.candidates(BatchStatus::Open, open_before, false).await? {
            warn!(
                batch_id = %record.batch_id,
                completed = record.completed_count(),
                expected = record.expected_unit_count,
                updated_at = %record.updated_at,
                "Batch has been OPEN past the alert threshold"
            );
            report.stuck_open.push(record.batch_id);
        }

        for (batch_id, error) in &report.failures {
            log_error("recovery_sweep", "run_once", error, Some(batch_id));
        }
        if !report.is_empty() {
            info!(
                resumed = report.resumed.len(),
                renotified = report.renotified.len(),
                stuck_open = report.stuck_open.len(),
                failures = report.failures.len(),
                "Recovery sweep pass finished"
            );
        }

        Ok(report)
    }

    /// Run `run_once` every `sweep_interval` until `shutdown` flips to `true`
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.sweep_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            log_error("recovery_sweep", "run_once", &e.to_string(), None);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Recovery sweep stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn candidates(
        &self,
        status: BatchStatus,
        updated_before: DateTime<Utc>,
        unnotified_only: bool,
    ) -> Result<Vec<BatchRecord>> {
        let mut filter = BatchFilter::status(status)
            .updated_before(updated_before)
            .limit(self.config.batch_limit);
        if unnotified_only {
            filter = filter.unnotified_only();
        }
        self.store.list_batches(&filter).await
    }

    async fn resume(&self, batch_id: &str, claimed: Result<bool>, report: &mut RecoveryReport) {
        match claimed {
            Ok(true) => {
                info!(batch_id, "Resuming abandoned consolidation");
                match self.pipeline.run(batch_id).await {
                    Ok(_) => report.resumed.push(batch_id.to_string()),
                    Err(e) => report.failures.push((batch_id.to_string(), e.to_string())),
                }
            }
            Ok(false) => debug!(batch_id, "Batch claimed by another process"),
            Err(e) => report.failures.push((batch_id.to_string(), e.to_string())),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
