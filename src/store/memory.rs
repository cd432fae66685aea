//! Process-local store adapters.
//!
//! Each batch record lives in its own `DashMap` entry, so every operation holds the
//! entry's shard lock for its whole duration and is atomic per record, matching the
//! consistency contract of the PostgreSQL adapters. State survives as long as the
//! store value does; coordinator instances sharing an `Arc` of it model restarts of a
//! stateless process in front of a durable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{
    ensure_legal_transition, keyed_rows, BatchFilter, BatchStateStore, CanonicalStore,
    CompletionApplied, StagingStore,
};
use crate::error::{BatchError, Result};
use crate::models::{BatchRecord, BusinessKey, StagedRow, StagedUnit, TransitionDetails};
use crate::state_machine::BatchStatus;

#[derive(Debug, Default)]
pub struct InMemoryBatchStateStore {
    batches: DashMap<String, BatchRecord>,
}

impl InMemoryBatchStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Overwrite `updated_at`, letting tests age a record past sweep thresholds
    pub fn set_updated_at(&self, batch_id: &str, updated_at: DateTime<Utc>) -> bool {
        match self.batches.get_mut(batch_id) {
            Some(mut record) => {
                record.updated_at = updated_at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BatchStateStore for InMemoryBatchStateStore {
    async fn create_batch(&self, batch_id: &str, expected_unit_count: u32) -> Result<BatchRecord> {
        match self.batches.entry(batch_id.to_string()) {
            Entry::Occupied(_) => Err(BatchError::validation(format!(
                "batch {batch_id} already exists"
            ))),
            Entry::Vacant(slot) => {
                let record = BatchRecord::new(batch_id, expected_unit_count, Utc::now());
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn fetch_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        Ok(self.batches.get(batch_id).map(|r| r.value().clone()))
    }

    async fn record_unit_completion(
        &self,
        batch_id: &str,
        unit_id: &str,
        output_count: u64,
    ) -> Result<CompletionApplied> {
        let mut record = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        if record.has_unit(unit_id) {
            return Ok(CompletionApplied::AlreadyRecorded);
        }
        if record.all_units_reported() {
            return Ok(CompletionApplied::CapacityExceeded);
        }

        record.completed_unit_ids.insert(unit_id.to_string());
        record.total_output_count = record.total_output_count.saturating_add(output_count);
        record.updated_at = Utc::now();
        Ok(CompletionApplied::Recorded)
    }

    async fn compare_and_set_status(
        &self,
        batch_id: &str,
        expected: BatchStatus,
        next: BatchStatus,
        details: &TransitionDetails,
    ) -> Result<bool> {
        ensure_legal_transition(batch_id, expected, next)?;

        let mut record = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        if record.status != expected {
            return Ok(false);
        }

        record.status = next;
        if let Some(reason) = &details.failure_reason {
            record.failure_reason = Some(reason.clone());
        }
        if let Some(rows) = details.rows_merged {
            record.rows_merged = Some(rows);
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn claim_stale(
        &self,
        batch_id: &str,
        status: BatchStatus,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut record = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        if record.status != status || record.updated_at > stale_before {
            return Ok(false);
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn heartbeat(&self, batch_id: &str, status: BatchStatus) -> Result<bool> {
        let mut record = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        if record.status != status {
            return Ok(false);
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_merge_verified(&self, batch_id: &str, rows_merged: u64) -> Result<bool> {
        let mut record = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        if record.status != BatchStatus::Consolidating {
            return Ok(false);
        }
        record.rows_merged = Some(rows_merged);
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_notified(&self, batch_id: &str) -> Result<bool> {
        let mut record = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| BatchError::unknown_batch(batch_id))?;

        if !record.needs_notification() {
            return Ok(false);
        }
        let now = Utc::now();
        record.notified_at = Some(now);
        record.updated_at = now;
        Ok(true)
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchRecord>> {
        let mut matching: Vec<BatchRecord> = self
            .batches
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        matching.truncate(usize::try_from(filter.limit.max(0)).unwrap_or(usize::MAX));
        Ok(matching)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStagingStore {
    units: DashMap<String, BTreeMap<String, StagedUnit>>,
}

impl InMemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit_count(&self, batch_id: &str) -> usize {
        self.units.get(batch_id).map_or(0, |units| units.len())
    }
}

#[async_trait]
impl StagingStore for InMemoryStagingStore {
    async fn stage_unit(&self, unit: StagedUnit) -> Result<()> {
        self.units
            .entry(unit.batch_id.clone())
            .or_default()
            .insert(unit.unit_id.clone(), unit);
        Ok(())
    }

    async fn list_staged_units(&self, batch_id: &str) -> Result<Vec<StagedUnit>> {
        Ok(self
            .units
            .get(batch_id)
            .map(|units| units.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_staged_units(&self, batch_id: &str) -> Result<u64> {
        Ok(self
            .units
            .remove(batch_id)
            .map_or(0, |(_, units)| units.len() as u64))
    }
}

/// A merged canonical row
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub key: BusinessKey,
    pub row: StagedRow,
    pub source_batch_id: String,
    pub merged_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InMemoryCanonicalStore {
    records: RwLock<BTreeMap<BusinessKey, CanonicalRecord>>,
}

impl InMemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BusinessKey) -> Option<CanonicalRecord> {
        self.records.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<CanonicalRecord> {
        self.records.read().values().cloned().collect()
    }
}

#[async_trait]
impl CanonicalStore for InMemoryCanonicalStore {
    async fn upsert_merge(
        &self,
        batch_id: &str,
        rows: &[StagedRow],
        key_columns: &[String],
    ) -> Result<u64> {
        // Validate everything before touching the map so a bad row merges nothing
        let keyed = keyed_rows(batch_id, rows, key_columns)?;
        let now = Utc::now();

        let mut records = self.records.write();
        for (key, row) in keyed {
            records.insert(
                key.clone(),
                CanonicalRecord {
                    key,
                    row: row.clone(),
                    source_batch_id: batch_id.to_string(),
                    merged_at: now,
                },
            );
        }
        Ok(rows.len() as u64)
    }

    async fn count_present(&self, keys: &[BusinessKey]) -> Result<u64> {
        let records = self.records.read();
        Ok(keys.iter().filter(|k| records.contains_key(*k)).count() as u64)
    }

    async fn row_count(&self) -> Result<u64> {
        Ok(self.records.read().len() as u64)
    }
}
