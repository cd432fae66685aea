//! Store and trigger doubles that inject the failures the coordinator must survive.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use tasker_batch::events::{BatchConsolidatedEvent, BatchNotifier};
use tasker_batch::orchestration::ConsolidationTrigger;
use tasker_batch::store::{CanonicalStore, InMemoryCanonicalStore, InMemoryStagingStore, StagingStore};
use tasker_batch::{BatchError, BusinessKey, Result, StagedRow, StagedUnit};

/// Counts hand-offs instead of consolidating
#[derive(Debug, Default)]
pub struct CountingTrigger {
    calls: AtomicUsize,
    batches: Mutex<Vec<String>>,
}

impl CountingTrigger {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<String> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl ConsolidationTrigger for CountingTrigger {
    async fn trigger(&self, batch_id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().push(batch_id.to_string());
        Ok(())
    }
}

/// Staging store whose deletes fail a set number of times with a transient error
pub struct FlakyStagingStore {
    inner: Arc<InMemoryStagingStore>,
    delete_failures: AtomicU32,
}

impl FlakyStagingStore {
    pub fn new(inner: Arc<InMemoryStagingStore>, delete_failures: u32) -> Self {
        Self {
            inner,
            delete_failures: AtomicU32::new(delete_failures),
        }
    }
}

#[async_trait]
impl StagingStore for FlakyStagingStore {
    async fn stage_unit(&self, unit: StagedUnit) -> Result<()> {
        self.inner.stage_unit(unit).await
    }

    async fn list_staged_units(&self, batch_id: &str) -> Result<Vec<StagedUnit>> {
        self.inner.list_staged_units(batch_id).await
    }

    async fn delete_staged_units(&self, batch_id: &str) -> Result<u64> {
        if self
            .delete_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BatchError::persistence(
                "delete_staged_units",
                "connection reset by peer",
            ));
        }
        self.inner.delete_staged_units(batch_id).await
    }
}

/// Staging store that stalls right after deleting a batch's units until released
pub struct StallingStagingStore {
    inner: Arc<InMemoryStagingStore>,
    pub deleted: Notify,
    pub release: Notify,
}

impl StallingStagingStore {
    pub fn new(inner: Arc<InMemoryStagingStore>) -> Self {
        Self {
            inner,
            deleted: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl StagingStore for StallingStagingStore {
    async fn stage_unit(&self, unit: StagedUnit) -> Result<()> {
        self.inner.stage_unit(unit).await
    }

    async fn list_staged_units(&self, batch_id: &str) -> Result<Vec<StagedUnit>> {
        self.inner.list_staged_units(batch_id).await
    }

    async fn delete_staged_units(&self, batch_id: &str) -> Result<u64> {
        let removed = self.inner.delete_staged_units(batch_id).await?;
        self.deleted.notify_one();
        self.release.notified().await;
        Ok(removed)
    }
}

/// How a faulty canonical store misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalFault {
    /// Reports success with zero affected rows and writes nothing
    SilentNoOp,
    /// Reports every row as affected but drops the last one
    DropsLastRow,
}

pub struct FaultyCanonicalStore {
    inner: Arc<InMemoryCanonicalStore>,
    fault: CanonicalFault,
}

impl FaultyCanonicalStore {
    pub fn new(inner: Arc<InMemoryCanonicalStore>, fault: CanonicalFault) -> Self {
        Self { inner, fault }
    }
}

#[async_trait]
impl CanonicalStore for FaultyCanonicalStore {
    async fn upsert_merge(
        &self,
        batch_id: &str,
        rows: &[StagedRow],
        key_columns: &[String],
    ) -> Result<u64> {
        match self.fault {
            CanonicalFault::SilentNoOp => Ok(0),
            CanonicalFault::DropsLastRow => {
                let kept = &rows[..rows.len().saturating_sub(1)];
                self.inner.upsert_merge(batch_id, kept, key_columns).await?;
                Ok(rows.len() as u64)
            }
        }
    }

    async fn count_present(&self, keys: &[BusinessKey]) -> Result<u64> {
        self.inner.count_present(keys).await
    }

    async fn row_count(&self) -> Result<u64> {
        self.inner.row_count().await
    }
}

/// Notifier that fails every delivery with a transient error
#[derive(Debug, Default)]
pub struct UnreachableNotifier {
    pub attempts: AtomicU32,
}

#[async_trait]
impl BatchNotifier for UnreachableNotifier {
    async fn notify_consolidated(&self, _event: &BatchConsolidatedEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BatchError::Notification("downstream unreachable".to_string()))
    }
}
