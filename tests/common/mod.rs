//! Shared helpers for the batch coordinator integration tests.
//!
//! Stores are held in `Arc`s by the harness so several coordinator instances can be
//! built over the same state, which is how a process restart is simulated.

#![allow(dead_code)]

pub mod doubles;
pub mod strategies;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use tasker_batch::config::{ConsolidationMode, CoordinatorConfig};
use tasker_batch::events::BroadcastNotifier;
use tasker_batch::orchestration::{BatchCoordinator, ConsolidationTrigger, CoordinatorStores};
use tasker_batch::store::{
    BatchStateStore, CanonicalStore, InMemoryBatchStateStore, InMemoryCanonicalStore,
    InMemoryStagingStore, StagingStore,
};
use tasker_batch::{BatchRecord, BatchStatus, StagedRow, StagedUnit, WorkUnitSpec};

pub use doubles::*;

/// Configuration with millisecond backoff so retry paths stay fast
pub fn fast_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.backoff.initial_delay_ms = 1;
    config.backoff.max_delay_ms = 2;
    config.backoff.max_attempts = 3;
    config.backoff.total_deadline_ms = 2_000;
    config.backoff.jitter_enabled = false;
    config
}

pub fn row(date: &str, key: &str, value: i64) -> StagedRow {
    StagedRow::from_value(json!({ "item_date": date, "item_key": key, "value": value }))
        .expect("row literal is an object")
}

/// `count` rows with keys `{prefix}-0 .. {prefix}-{count-1}` on one date
pub fn rows(prefix: &str, count: usize) -> Vec<StagedRow> {
    (0..count)
        .map(|i| row("2024-06-01", &format!("{prefix}-{i}"), i as i64))
        .collect()
}

pub fn units(ids: &[&str]) -> Vec<WorkUnitSpec> {
    ids.iter().map(|id| WorkUnitSpec::bare(*id)).collect()
}

pub fn numbered_units(count: usize) -> Vec<WorkUnitSpec> {
    (0..count)
        .map(|i| WorkUnitSpec::bare(format!("u{i:03}")))
        .collect()
}

pub struct TestHarness {
    pub state: Arc<InMemoryBatchStateStore>,
    pub staging: Arc<InMemoryStagingStore>,
    pub canonical: Arc<InMemoryCanonicalStore>,
    pub notifier: Arc<BroadcastNotifier>,
    pub config: CoordinatorConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self {
            state: Arc::new(InMemoryBatchStateStore::new()),
            staging: Arc::new(InMemoryStagingStore::new()),
            canonical: Arc::new(InMemoryCanonicalStore::new()),
            notifier: Arc::new(BroadcastNotifier::new(256)),
            config,
        }
    }

    pub fn background() -> Self {
        let mut config = fast_config();
        config.consolidation.mode = ConsolidationMode::Background;
        Self::with_config(config)
    }

    pub fn stores(&self) -> CoordinatorStores {
        CoordinatorStores {
            state: self.state.clone(),
            staging: self.staging.clone(),
            canonical: self.canonical.clone(),
        }
    }

    /// A fresh coordinator process over the shared stores
    pub fn coordinator(&self) -> BatchCoordinator {
        BatchCoordinator::new(&self.config, self.stores(), self.notifier.clone())
            .expect("test config is valid")
    }

    pub fn coordinator_with_stores(&self, stores: CoordinatorStores) -> BatchCoordinator {
        BatchCoordinator::new(&self.config, stores, self.notifier.clone())
            .expect("test config is valid")
    }

    pub fn coordinator_with_trigger(&self, trigger: Arc<dyn ConsolidationTrigger>) -> BatchCoordinator {
        self.coordinator().with_consolidation_trigger(trigger)
    }

    pub async fn stage(&self, batch_id: &str, unit_id: &str, rows: Vec<StagedRow>) {
        self.staging
            .stage_unit(StagedUnit::new(batch_id, unit_id, rows))
            .await
            .expect("in-memory staging never fails");
    }

    pub async fn record(&self, batch_id: &str) -> BatchRecord {
        self.state
            .fetch_batch(batch_id)
            .await
            .expect("in-memory fetch never fails")
            .expect("batch exists")
    }

    pub async fn canonical_rows(&self) -> u64 {
        self.canonical.row_count().await.expect("in-memory count never fails")
    }

    /// Push `updated_at` into the past so sweep thresholds consider the batch stale
    pub fn age(&self, batch_id: &str, by: chrono::Duration) {
        let record_updated = chrono::Utc::now() - by;
        assert!(self.state.set_updated_at(batch_id, record_updated));
    }

    /// Poll until the batch reaches `status` or the timeout passes
    pub async fn wait_for_status(&self, batch_id: &str, status: BatchStatus) -> BatchRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = self.record(batch_id).await;
            if record.status == status || tokio::time::Instant::now() >= deadline {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
