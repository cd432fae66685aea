//! PostgreSQL store adapters.
//!
//! Completion reports are a single conditional `UPDATE` per report: PostgreSQL row
//! locking serialises concurrent updates to the same batch and re-evaluates the
//! `WHERE` clause against the latest row version, so no report is lost and no
//! serialization failure surfaces under contention. Status transitions are
//! `UPDATE ... WHERE status = $expected`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use std::collections::BTreeSet;
use tracing::debug;

use super::{
    ensure_legal_transition, keyed_rows, BatchFilter, BatchStateStore, CanonicalStore,
    CompletionApplied, StagingStore,
};
use crate::error::{BatchError, Result};
use crate::models::{BatchRecord, BusinessKey, StagedRow, StagedUnit, TransitionDetails};
use crate::state_machine::BatchStatus;

const BATCH_COLUMNS: &str = "batch_id, expected_unit_count, completed_unit_ids, total_output_count, \
     status, failure_reason, rows_merged, notified_at, created_at, updated_at";

/// Raw `tasker_batches` row
#[derive(Debug, FromRow)]
struct BatchRecordRow {
    batch_id: String,
    expected_unit_count: i32,
    completed_unit_ids: Vec<String>,
    total_output_count: i64,
    status: String,
    failure_reason: Option<String>,
    rows_merged: Option<i64>,
    notified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRecordRow> for BatchRecord {
    type Error = BatchError;

    fn try_from(row: BatchRecordRow) -> Result<Self> {
        let status = row.status.parse::<BatchStatus>().map_err(|e| {
            BatchError::persistence("decode_batch", format!("{e} for batch {}", row.batch_id))
        })?;
        Ok(Self {
            expected_unit_count: u32::try_from(row.expected_unit_count).map_err(|_| {
                BatchError::persistence("decode_batch", "negative expected_unit_count")
            })?,
            completed_unit_ids: row.completed_unit_ids.into_iter().collect::<BTreeSet<_>>(),
            total_output_count: u64::try_from(row.total_output_count).unwrap_or_default(),
            rows_merged: row.rows_merged.and_then(|r| u64::try_from(r).ok()),
            batch_id: row.batch_id,
            status,
            failure_reason: row.failure_reason,
            notified_at: row.notified_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| BatchError::validation(format!("{what} {value} is too large")))
}

#[derive(Debug, Clone)]
pub struct PgBatchStateStore {
    pool: PgPool,
}

impl PgBatchStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, batch_id: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM tasker_batches WHERE batch_id = $1)",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("batch_exists"))
    }
}

#[async_trait]
impl BatchStateStore for PgBatchStateStore {
    async fn create_batch(&self, batch_id: &str, expected_unit_count: u32) -> Result<BatchRecord> {
        let expected = i32::try_from(expected_unit_count).map_err(|_| {
            BatchError::validation(format!("expected_unit_count {expected_unit_count} is too large"))
        })?;

        let sql = format!(
            r#"
            INSERT INTO tasker_batches
                (batch_id, expected_unit_count, completed_unit_ids, total_output_count, status)
            VALUES ($1, $2, '{{}}', 0, 'OPEN')
            ON CONFLICT (batch_id) DO NOTHING
            RETURNING {BATCH_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, BatchRecordRow>(&sql)
            .bind(batch_id)
            .bind(expected)
            .fetch_optional(&self.pool)
            .await
            .map_err(BatchError::from_sqlx("create_batch"))?;

        match row {
            Some(row) => row.try_into(),
            None => Err(BatchError::validation(format!(
                "batch {batch_id} already exists"
            ))),
        }
    }

    async fn fetch_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM tasker_batches WHERE batch_id = $1");
        sqlx::query_as::<_, BatchRecordRow>(&sql)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(BatchError::from_sqlx("fetch_batch"))?
            .map(BatchRecord::try_from)
            .transpose()
    }

    async fn record_unit_completion(
        &self,
        batch_id: &str,
        unit_id: &str,
        output_count: u64,
    ) -> Result<CompletionApplied> {
        let output_count = to_i64(output_count, "output_count")?;

        let result = sqlx::query(
            r#"
            UPDATE tasker_batches
            SET completed_unit_ids = array_append(completed_unit_ids, $2),
                total_output_count = total_output_count + $3,
                updated_at = NOW()
            WHERE batch_id = $1
              AND NOT ($2 = ANY(completed_unit_ids))
              AND cardinality(completed_unit_ids) < expected_unit_count
            "#,
        )
        .bind(batch_id)
        .bind(unit_id)
        .bind(output_count)
        .execute(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("record_unit_completion"))?;

        if result.rows_affected() == 1 {
            return Ok(CompletionApplied::Recorded);
        }

        // Both guard conditions only ever become true, so classifying afterwards is safe
        let already = sqlx::query_scalar::<_, bool>(
            "SELECT $2 = ANY(completed_unit_ids) FROM tasker_batches WHERE batch_id = $1",
        )
        .bind(batch_id)
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("classify_unit_completion"))?;

        match already {
            None => Err(BatchError::unknown_batch(batch_id)),
            Some(true) => Ok(CompletionApplied::AlreadyRecorded),
            Some(false) => Ok(CompletionApplied::CapacityExceeded),
        }
    }

    async fn compare_and_set_status(
        &self,
        batch_id: &str,
        expected: BatchStatus,
        next: BatchStatus,
        details: &TransitionDetails,
    ) -> Result<bool> {
        ensure_legal_transition(batch_id, expected, next)?;
        let rows_merged = details
            .rows_merged
            .map(|r| to_i64(r, "rows_merged"))
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE tasker_batches
            SET status = $3,
                failure_reason = COALESCE($4, failure_reason),
                rows_merged = COALESCE($5, rows_merged),
                updated_at = NOW()
            WHERE batch_id = $1 AND status = $2
            "#,
        )
        .bind(batch_id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(details.failure_reason.as_deref())
        .bind(rows_merged)
        .execute(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("compare_and_set_status"))?;

        if result.rows_affected() == 1 {
            debug!(batch_id, from = %expected, to = %next, "Batch status transition applied");
            return Ok(true);
        }
        if self.exists(batch_id).await? {
            Ok(false)
        } else {
            Err(BatchError::unknown_batch(batch_id))
        }
    }

    async fn claim_stale(
        &self,
        batch_id: &str,
        status: BatchStatus,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasker_batches
            SET updated_at = NOW()
            WHERE batch_id = $1 AND status = $2 AND updated_at <= $3
            "#,
        )
        .bind(batch_id)
        .bind(status.as_str())
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("claim_stale"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(&self, batch_id: &str, status: BatchStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasker_batches
            SET updated_at = NOW()
            WHERE batch_id = $1 AND status = $2
            "#,
        )
        .bind(batch_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("heartbeat"))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists(batch_id).await? {
            Ok(false)
        } else {
            Err(BatchError::unknown_batch(batch_id))
        }
    }

    async fn record_merge_verified(&self, batch_id: &str, rows_merged: u64) -> Result<bool> {
        let rows_merged = to_i64(rows_merged, "rows_merged")?;
        let result = sqlx::query(
            r#"
            UPDATE tasker_batches
            SET rows_merged = $2, updated_at = NOW()
            WHERE batch_id = $1 AND status = 'CONSOLIDATING'
            "#,
        )
        .bind(batch_id)
        .bind(rows_merged)
        .execute(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("record_merge_verified"))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists(batch_id).await? {
            Ok(false)
        } else {
            Err(BatchError::unknown_batch(batch_id))
        }
    }

    async fn mark_notified(&self, batch_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasker_batches
            SET notified_at = NOW(), updated_at = NOW()
            WHERE batch_id = $1 AND status = 'CONSOLIDATED' AND notified_at IS NULL
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("mark_notified"))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists(batch_id).await? {
            Ok(false)
        } else {
            Err(BatchError::unknown_batch(batch_id))
        }
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchRecord>> {
        let sql = format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM tasker_batches
            WHERE status = $1
              AND ($2::timestamptz IS NULL OR updated_at <= $2)
              AND (NOT $3 OR notified_at IS NULL)
            ORDER BY updated_at ASC
            LIMIT $4
            "#
        );
        sqlx::query_as::<_, BatchRecordRow>(&sql)
            .bind(filter.status.as_str())
            .bind(filter.updated_before)
            .bind(filter.unnotified_only)
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await
            .map_err(BatchError::from_sqlx("list_batches"))?
            .into_iter()
            .map(BatchRecord::try_from)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgStagingStore {
    pool: PgPool,
}

impl PgStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode_unit(row: &PgRow) -> std::result::Result<StagedUnit, sqlx::Error> {
        let Json(rows): Json<Vec<StagedRow>> = row.try_get("rows")?;
        Ok(StagedUnit {
            batch_id: row.try_get("batch_id")?,
            unit_id: row.try_get("unit_id")?,
            rows,
            staged_at: row.try_get("staged_at")?,
        })
    }
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn stage_unit(&self, unit: StagedUnit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasker_batch_staged_units (batch_id, unit_id, rows, staged_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (batch_id, unit_id)
            DO UPDATE SET rows = EXCLUDED.rows, staged_at = EXCLUDED.staged_at
            "#,
        )
        .bind(&unit.batch_id)
        .bind(&unit.unit_id)
        .bind(Json(&unit.rows))
        .bind(unit.staged_at)
        .execute(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("stage_unit"))?;
        Ok(())
    }

    async fn list_staged_units(&self, batch_id: &str) -> Result<Vec<StagedUnit>> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, unit_id, rows, staged_at
            FROM tasker_batch_staged_units
            WHERE batch_id = $1
            ORDER BY unit_id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("list_staged_units"))?;

        rows.iter()
            .map(Self::decode_unit)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(BatchError::from_sqlx("decode_staged_unit"))
    }

    async fn delete_staged_units(&self, batch_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tasker_batch_staged_units WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await
            .map_err(BatchError::from_sqlx("delete_staged_units"))?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PgCanonicalStore {
    pool: PgPool,
}

impl PgCanonicalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CanonicalStore for PgCanonicalStore {
    async fn upsert_merge(
        &self,
        batch_id: &str,
        rows: &[StagedRow],
        key_columns: &[String],
    ) -> Result<u64> {
        let keyed = keyed_rows(batch_id, rows, key_columns)?;
        let (keys, records): (Vec<String>, Vec<Value>) = keyed
            .into_iter()
            .map(|(key, row)| (key.encode(), row.to_value()))
            .unzip();

        // One statement: the whole merge becomes visible at once or not at all
        let result = sqlx::query(
            r#"
            INSERT INTO tasker_canonical_records (business_key, record, source_batch_id, merged_at)
            SELECT t.business_key, t.record, $3, NOW()
            FROM UNNEST($1::text[], $2::jsonb[]) AS t(business_key, record)
            ON CONFLICT (business_key) DO UPDATE
            SET record = EXCLUDED.record,
                source_batch_id = EXCLUDED.source_batch_id,
                merged_at = EXCLUDED.merged_at
            "#,
        )
        .bind(&keys)
        .bind(&records)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("upsert_merge"))?;

        Ok(result.rows_affected())
    }

    async fn count_present(&self, keys: &[BusinessKey]) -> Result<u64> {
        let encoded: Vec<String> = keys.iter().map(BusinessKey::encode).collect();
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tasker_canonical_records WHERE business_key = ANY($1)",
        )
        .bind(&encoded)
        .fetch_one(&self.pool)
        .await
        .map_err(BatchError::from_sqlx("count_present"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn row_count(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasker_canonical_records")
            .fetch_one(&self.pool)
            .await
            .map_err(BatchError::from_sqlx("row_count"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
