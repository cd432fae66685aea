//! PostgreSQL adapter tests. Each test gets a fresh database with `./migrations`
//! applied; run with `DATABASE_URL` set and `--ignored`.

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::collections::BTreeSet;
use std::sync::Arc;

use tasker_batch::database::DatabaseMigrations;
use tasker_batch::models::TransitionDetails;
use tasker_batch::store::{
    BatchFilter, BatchStateStore, CanonicalStore, CompletionApplied, PgBatchStateStore,
    PgCanonicalStore, PgStagingStore, StagingStore,
};
use tasker_batch::{BatchError, BatchStatus, StagedRow, StagedUnit};

fn keys() -> Vec<String> {
    vec!["item_date".to_string(), "item_key".to_string()]
}

fn row(key: &str, value: i64) -> StagedRow {
    StagedRow::from_value(json!({ "item_date": "2024-06-01", "item_key": key, "value": value }))
        .unwrap()
}

#[sqlx::test]
#[ignore = "requires PostgreSQL"]
async fn test_create_and_duplicate_create(pool: PgPool) {
    let store = PgBatchStateStore::new(pool);

    let record = store.create_batch("b1", 3).await.unwrap();
    assert_eq!(record.status, BatchStatus::Open);
    assert_eq!(record.expected_unit_count, 3);
    assert!(record.completed_unit_ids.is_empty());

    let err = store.create_batch("b1", 3).await.unwrap_err();
    assert!(matches!(err, BatchError::Validation(_)));
    assert!(store.fetch_batch("missing").await.unwrap().is_none());
}

#[sqlx::test]
#[ignore = "requires PostgreSQL"]
async fn test_completion_is_gated_per_unit(pool: PgPool) {
    let store = PgBatchStateStore::new(pool);
    store.create_batch("b1", 2).await.unwrap();

    assert_eq!(
        store.record_unit_completion("b1", "u1", 5).await.unwrap(),
        CompletionApplied::Recorded
    );
    assert_eq!(
        store.record_unit_completion("b1", "u1", 5).await.unwrap(),
        CompletionApplied::AlreadyRecorded
    );
    assert_eq!(
        store.record_unit_completion("b1", "u2", 0).await.unwrap(),
        CompletionApplied::Recorded
    );
    assert_eq!(
        store.record_unit_completion("b1", "u3", 1).await.unwrap(),
        CompletionApplied::CapacityExceeded
    );
    assert!(matches!(
        store.record_unit_completion("nope", "u1", 1).await,
        Err(BatchError::UnknownBatch { .. })
    ));

    let record = store.fetch_batch("b1").await.unwrap().unwrap();
    let expected: BTreeSet<String> = ["u1", "u2"].iter().map(|s| s.to_string()).collect();
    assert_eq!(record.completed_unit_ids, expected);
    assert_eq!(record.total_output_count, 5);
    assert!(record.all_units_reported());
}

#[sqlx::test]
#[ignore = "requires PostgreSQL"]
async fn test_concurrent_reports_lose_nothing(pool: PgPool) {
    let store = Arc::new(PgBatchStateStore::new(pool));
    store.create_batch("b1", 40).await.unwrap();

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .record_unit_completion("b1", &format!("u{i:02}"), 2)
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), CompletionApplied::Recorded);
    }

    let record = store.fetch_batch("b1").await.unwrap().unwrap();
    assert_eq!(record.completed_count(), 40);
    assert_eq!(record.total_output_count, 80);
}

#[sqlx::test]
#[ignore = "requires PostgreSQL"]
async fn test_status_compare_and_set(pool: PgPool) {
    let store = PgBatchStateStore::new(pool);
    store.create_batch("b1", 1).await.unwrap();
    let none = TransitionDetails::default();

    assert!(store
        .compare_and_set_status("b1", BatchStatus::Open, BatchStatus::Complete, &none)
        .await
        .unwrap());
    assert!(!store
        .compare_and_set_status("b1", BatchStatus::Open, BatchStatus::Complete, &none)
        .await
        .unwrap());
    assert!(store
        .compare_and_set_status("b1", BatchStatus::Complete, BatchStatus::Consolidating, &none)
        .await
        .unwrap());
    assert!(store
        .compare_and_set_status(
            "b1",
            BatchStatus::Consolidating,
            BatchStatus::Consolidated,
            &TransitionDetails::consolidated(7),
        )
        .await
        .unwrap());

    let err = store
        .compare_and_set_status("b1", BatchStatus::Consolidated, BatchStatus::Open, &none)
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::InvalidTransition { .. }));

    let record = store.fetch_batch("b1").await.unwrap().unwrap();
    assert_eq!(record.status, BatchStatus::Consolidated);
    assert_eq!(record.rows_merged, Some(7));
}

#[sqlx::test]
#[ignore = "requires PostgreSQL"]
async fn test_claim_stale_and_mark_notified(pool: PgPool) {
    let store = PgBatchStateStore::new(pool.clone());
    store.create_batch("b1", 1).await.unwrap();
    let none = TransitionDetails::default();
    store
        .compare_and_set_status("b1", BatchStatus::Open, BatchStatus::Complete, &none)
        .await
        .unwrap();
    store
        .compare_and_set_status("b1", BatchStatus::Complete, BatchStatus::Consolidating, &none)
        .await
        .unwrap();

    // Fresh record is not stale
    let cutoff = Utc::now() - Duration::minutes(5);
    assert!(!store
        .claim_stale("b1", BatchStatus::Consolidating, cutoff)
        .await
        .unwrap());

    sqlx::query("UPDATE tasker_batches SET updated_at = NOW() - INTERVAL '1 hour' WHERE batch_id = 'b1'")
        .execute(&pool)
        .await
        .unwrap();
    let stale = BatchFilter::status(BatchStatus::Consolidating).updated_before(cutoff);
    assert_eq!(store.list_batches(&stale).await.unwrap().len(), 1);
    assert!(store
        .claim_stale("b1", BatchStatus::Consolidating, cutoff)
        .await
        .unwrap());
    assert!(!store
        .claim_stale("b1", BatchStatus::Consolidating, cutoff)
        .await
        .unwrap());

    assert!(!store.heartbeat("b1", BatchStatus::Complete).await.unwrap());
    assert!(store.heartbeat("b1", BatchStatus::Consolidating).await.unwrap());
    assert!(store.record_merge_verified("b1", 4).await.unwrap());
    let record = store.fetch_batch("b1").await.unwrap().unwrap();
    assert_eq!(record.status, BatchStatus::Consolidating);
    assert_eq!(record.rows_merged, Some(4));

    assert!(!store.mark_notified("b1").await.unwrap());
    store
        .compare_and_set_status(
            "b1",
            BatchStatus::Consolidating,
            BatchStatus::Consolidated,
            &TransitionDetails::consolidated(4),
        )
        .await
        .unwrap();
    let unnotified = BatchFilter::status(BatchStatus::Consolidated).unnotified_only();
    assert_eq!(store.list_batches(&unnotified).await.unwrap().len(), 1);

    assert!(store.mark_notified("b1").await.unwrap());
    assert!(!store.mark_notified("b1").await.unwrap());
    assert!(store.list_batches(&unnotified).await.unwrap().is_empty());
    assert!(!store.record_merge_verified("b1", 9).await.unwrap());
    assert_eq!(store.fetch_batch("b1").await.unwrap().unwrap().rows_merged, Some(4));
}

#[sqlx::test]
#[ignore = "requires PostgreSQL"]
async fn test_staging_round_trip(pool: PgPool) {
    let store = PgStagingStore::new(pool);
    store
        .stage_unit(StagedUnit::new("b1", "u2", vec![row("a", 1)]))
        .await
        .unwrap();
    store
        .stage_unit(StagedUnit::new("b1", "u1", vec![row("b", 2), row("c", 3)]))
        .await
        .unwrap();
    // Re-staging replaces the unit's rows
    store
        .stage_unit(StagedUnit::new("b1", "u2", vec![row("a", 10)]))
        .await
        .unwrap();
    store
        .stage_unit(StagedUnit::new("b2", "u1", vec![row("z", 0)]))
        .await
        .unwrap();

    let units = store.list_staged_units("b1").await.unwrap();
    let ids: Vec<_> = units.iter().map(|u| u.unit_id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "u2"]);
    assert_eq!(units[1].rows, vec![row("a", 10)]);

    assert_eq!(store.delete_staged_units("b1").await.unwrap(), 2);
    assert!(store.list_staged_units("b1").await.unwrap().is_empty());
    assert_eq!(store.list_staged_units("b2").await.unwrap().len(), 1);
}

#[sqlx::test]
#[ignore = "requires PostgreSQL"]
async fn test_canonical_upsert_and_read_back(pool: PgPool) {
    let store = PgCanonicalStore::new(pool);
    let columns = keys();

    let first = vec![row("a", 1), row("b", 2)];
    assert_eq!(store.upsert_merge("b1", &first, &columns).await.unwrap(), 2);

    let second = vec![row("b", 20), row("c", 3)];
    assert_eq!(store.upsert_merge("b2", &second, &columns).await.unwrap(), 2);
    assert_eq!(store.row_count().await.unwrap(), 3);

    let lookup: Vec<_> = [row("a", 0), row("c", 0), row("missing", 0)]
        .iter()
        .map(|r| r.business_key(&columns).unwrap())
        .collect();
    assert_eq!(store.count_present(&lookup).await.unwrap(), 2);

    let duplicate = vec![row("d", 1), row("d", 2)];
    assert!(matches!(
        store.upsert_merge("b3", &duplicate, &columns).await,
        Err(BatchError::InvalidStagedData { .. })
    ));
}

#[sqlx::test]
#[ignore = "requires PostgreSQL"]
async fn test_migrations_are_idempotent(pool: PgPool) {
    let first = DatabaseMigrations::run_all(&pool).await.unwrap();
    assert_eq!(first.len(), DatabaseMigrations::all().len());
    let second = DatabaseMigrations::run_all(&pool).await.unwrap();
    assert!(second.is_empty());
}
