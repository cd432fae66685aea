mod common;

use common::*;
use std::sync::Arc;
use tasker_batch::orchestration::CoordinatorStores;
use tasker_batch::store::StagingStore;
use tasker_batch::{BatchError, BatchStatus};

/// Drive a batch to CONSOLIDATING without consolidating it
async fn claimed_batch(harness: &TestHarness, unit_ids: &[&str], output: u64) -> String {
    let trigger = Arc::new(CountingTrigger::default());
    let coordinator = harness.coordinator_with_trigger(trigger.clone());
    let batch_id = coordinator.start_batch(&units(unit_ids)).await.unwrap();
    for unit_id in unit_ids {
        coordinator
            .report_completion(&batch_id, unit_id, output)
            .await
            .unwrap();
    }
    assert_eq!(trigger.calls(), 1);
    batch_id
}

#[tokio::test]
async fn test_zero_staged_units_is_fatal_not_silent() {
    let harness = TestHarness::new();
    let batch_id = claimed_batch(&harness, &["u1", "u2"], 3).await;

    let err = harness.coordinator().consolidate(&batch_id).await.unwrap_err();

    assert!(matches!(err, BatchError::NoStagedData { .. }));
    assert!(err.is_data_integrity());
    let record = harness.record(&batch_id).await;
    assert_eq!(record.status, BatchStatus::Failed);
    assert!(record.failure_reason.unwrap().contains("no_staged_data"));
    assert_eq!(harness.canonical_rows().await, 0);
}

#[tokio::test]
async fn test_completed_unit_without_staged_output_fails() {
    let harness = TestHarness::new();
    let trigger = Arc::new(CountingTrigger::default());
    let coordinator = harness.coordinator_with_trigger(trigger.clone());
    let batch_id = coordinator.start_batch(&units(&["u1", "u2"])).await.unwrap();
    harness.stage(&batch_id, "u1", rows("a", 3)).await;
    coordinator.report_completion(&batch_id, "u1", 3).await.unwrap();
    coordinator.report_completion(&batch_id, "u2", 4).await.unwrap();
    assert_eq!(trigger.calls(), 1);

    let err = harness.coordinator().consolidate(&batch_id).await.unwrap_err();

    match &err {
        BatchError::NoStagedData { detail, .. } => assert!(detail.contains("u2")),
        other => panic!("unexpected error: {other:?}"),
    }
    let record = harness.record(&batch_id).await;
    assert_eq!(record.status, BatchStatus::Failed);
    assert_eq!(record.rows_merged, None);
    assert_eq!(harness.canonical_rows().await, 0);
    assert_eq!(harness.staging.unit_count(&batch_id), 1);
}

#[tokio::test]
async fn test_staged_rows_short_of_reported_outputs_fail() {
    let harness = TestHarness::new();
    let batch_id = claimed_batch(&harness, &["u1", "u2"], 5).await;
    harness.stage(&batch_id, "u1", rows("a", 5)).await;
    harness.stage(&batch_id, "u2", rows("b", 2)).await;

    let err = harness.coordinator().consolidate(&batch_id).await.unwrap_err();

    assert!(matches!(
        err,
        BatchError::MergeVerification {
            expected: 10,
            observed: 7,
            ..
        }
    ));
    assert_eq!(harness.record(&batch_id).await.status, BatchStatus::Failed);
    assert_eq!(harness.canonical_rows().await, 0);
    assert_eq!(harness.staging.unit_count(&batch_id), 2);
}

#[tokio::test]
async fn test_row_shortfall_within_tolerance_is_accepted() {
    let mut config = fast_config();
    config.consolidation.merge_tolerance = 0.25;
    let harness = TestHarness::with_config(config);
    let batch_id = claimed_batch(&harness, &["u1"], 10).await;
    harness.stage(&batch_id, "u1", rows("a", 8)).await;

    let result = harness.coordinator().consolidate(&batch_id).await.unwrap();

    assert_eq!(result.staged_rows, 8);
    assert_eq!(result.rows_merged, 8);
    assert_eq!(harness.record(&batch_id).await.status, BatchStatus::Consolidated);
}

#[tokio::test]
async fn test_failed_batch_is_terminal() {
    let harness = TestHarness::new();
    let batch_id = claimed_batch(&harness, &["u1"], 1).await;
    let coordinator = harness.coordinator();
    coordinator.consolidate(&batch_id).await.unwrap_err();

    // Data arriving late does not resurrect the batch
    harness.stage(&batch_id, "u1", rows("late", 1)).await;
    let err = coordinator.consolidate(&batch_id).await.unwrap_err();
    assert!(matches!(err, BatchError::InvalidTransition { .. }));
    assert_eq!(harness.record(&batch_id).await.status, BatchStatus::Failed);
    assert_eq!(harness.staging.unit_count(&batch_id), 1);
}

#[tokio::test]
async fn test_silent_zero_row_merge_fails_verification() {
    let harness = TestHarness::new();
    let batch_id = claimed_batch(&harness, &["u1", "u2"], 2).await;
    harness.stage(&batch_id, "u1", rows("a", 2)).await;
    harness.stage(&batch_id, "u2", rows("b", 2)).await;

    let stores = CoordinatorStores {
        canonical: Arc::new(FaultyCanonicalStore::new(
            harness.canonical.clone(),
            CanonicalFault::SilentNoOp,
        )),
        ..harness.stores()
    };
    let err = harness
        .coordinator_with_stores(stores)
        .consolidate(&batch_id)
        .await
        .unwrap_err();

    match err {
        BatchError::MergeVerification {
            expected, observed, ..
        } => {
            assert_eq!(expected, 4);
            assert_eq!(observed, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let record = harness.record(&batch_id).await;
    assert_eq!(record.status, BatchStatus::Failed);
    // Staged data is preserved for investigation
    assert_eq!(harness.staging.unit_count(&batch_id), 2);
}

#[tokio::test]
async fn test_read_back_catches_rows_reported_but_not_written() {
    let harness = TestHarness::new();
    let batch_id = claimed_batch(&harness, &["u1"], 3).await;
    harness.stage(&batch_id, "u1", rows("a", 3)).await;

    let stores = CoordinatorStores {
        canonical: Arc::new(FaultyCanonicalStore::new(
            harness.canonical.clone(),
            CanonicalFault::DropsLastRow,
        )),
        ..harness.stores()
    };
    let err = harness
        .coordinator_with_stores(stores)
        .consolidate(&batch_id)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BatchError::MergeVerification {
            expected: 3,
            observed: 2,
            ..
        }
    ));
    assert_eq!(harness.record(&batch_id).await.status, BatchStatus::Failed);
    assert_eq!(harness.staging.unit_count(&batch_id), 1);
}

#[tokio::test]
async fn test_crash_between_merge_and_cleanup_is_safe_to_rerun() {
    let harness = TestHarness::new();
    let batch_id = claimed_batch(&harness, &["u1", "u2"], 4).await;
    harness.stage(&batch_id, "u1", rows("a", 4)).await;
    harness.stage(&batch_id, "u2", rows("b", 4)).await;

    // Cleanup keeps failing past the retry budget
    let stores = CoordinatorStores {
        staging: Arc::new(FlakyStagingStore::new(harness.staging.clone(), 10)),
        ..harness.stores()
    };
    let err = harness
        .coordinator_with_stores(stores)
        .consolidate(&batch_id)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let after_first = harness.canonical_rows().await;
    assert_eq!(after_first, 8);
    assert_eq!(harness.record(&batch_id).await.status, BatchStatus::Consolidating);
    assert_eq!(harness.staging.unit_count(&batch_id), 2);

    let result = harness.coordinator().consolidate(&batch_id).await.unwrap();
    assert_eq!(result.units_cleaned, 2);
    assert_eq!(harness.canonical_rows().await, after_first);
    assert_eq!(harness.record(&batch_id).await.status, BatchStatus::Consolidated);
    assert_eq!(harness.staging.unit_count(&batch_id), 0);
}

#[tokio::test]
async fn test_transient_cleanup_failure_is_retried_in_place() {
    let harness = TestHarness::new();
    let batch_id = claimed_batch(&harness, &["u1"], 2).await;
    harness.stage(&batch_id, "u1", rows("a", 2)).await;

    let stores = CoordinatorStores {
        staging: Arc::new(FlakyStagingStore::new(harness.staging.clone(), 1)),
        ..harness.stores()
    };
    let result = harness
        .coordinator_with_stores(stores)
        .consolidate(&batch_id)
        .await
        .unwrap();

    assert_eq!(result.rows_merged, 2);
    assert_eq!(harness.record(&batch_id).await.status, BatchStatus::Consolidated);
}

#[tokio::test]
async fn test_rerun_on_consolidated_batch_does_not_grow_canonical_store() {
    let harness = TestHarness::new();
    let coordinator = harness.coordinator();
    let batch_id = coordinator.start_batch(&units(&["u1", "u2"])).await.unwrap();
    harness.stage(&batch_id, "u1", rows("a", 3)).await;
    harness.stage(&batch_id, "u2", rows("b", 3)).await;
    coordinator.report_completion(&batch_id, "u1", 3).await.unwrap();
    coordinator.report_completion(&batch_id, "u2", 3).await.unwrap();

    let record = harness.record(&batch_id).await;
    assert_eq!(record.status, BatchStatus::Consolidated);
    assert_eq!(record.rows_merged, Some(6));
    let after_first = harness.canonical_rows().await;
    assert_eq!(after_first, 6);

    // Simulate staged units that were never deleted
    harness.stage(&batch_id, "u1", rows("a", 3)).await;
    harness.stage(&batch_id, "u2", rows("b", 3)).await;

    let rerun = coordinator.consolidate(&batch_id).await.unwrap();
    assert!(rerun.already_consolidated);
    assert_eq!(rerun.rows_merged, 6);
    assert_eq!(rerun.units_cleaned, 2);
    assert_eq!(harness.canonical_rows().await, after_first);
    assert_eq!(harness.record(&batch_id).await.rows_merged, Some(6));
    assert!(harness
        .staging
        .list_staged_units(&batch_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_rerun_batch_over_same_keys_upserts() {
    let harness = TestHarness::new();
    let coordinator = harness.coordinator();

    for value_offset in [0_i64, 100] {
        let batch_id = coordinator.start_batch(&units(&["u1"])).await.unwrap();
        let staged: Vec<_> = (0..5)
            .map(|i| row("2024-06-01", &format!("k{i}"), i + value_offset))
            .collect();
        harness.stage(&batch_id, "u1", staged).await;
        coordinator.report_completion(&batch_id, "u1", 5).await.unwrap();
        assert_eq!(harness.record(&batch_id).await.status, BatchStatus::Consolidated);
    }

    assert_eq!(harness.canonical_rows().await, 5);
    let latest = harness
        .canonical
        .snapshot()
        .into_iter()
        .find(|r| r.row.get("item_key") == Some(&serde_json::json!("k0")))
        .unwrap();
    assert_eq!(latest.row.get("value"), Some(&serde_json::json!(100)));
}

#[tokio::test]
async fn test_notification_failure_does_not_undo_consolidation() {
    let harness = TestHarness::new();
    let batch_id = claimed_batch(&harness, &["u1"], 1).await;
    harness.stage(&batch_id, "u1", rows("a", 1)).await;

    let notifier = Arc::new(UnreachableNotifier::default());
    let coordinator = tasker_batch::BatchCoordinator::new(
        &harness.config,
        harness.stores(),
        notifier.clone(),
    )
    .unwrap();

    let err = coordinator.consolidate(&batch_id).await.unwrap_err();
    assert!(matches!(err, BatchError::Notification(_)));
    assert_eq!(
        notifier.attempts.load(std::sync::atomic::Ordering::SeqCst),
        harness.config.backoff.max_attempts
    );

    let record = harness.record(&batch_id).await;
    assert_eq!(record.status, BatchStatus::Consolidated);
    assert!(record.needs_notification());
}
