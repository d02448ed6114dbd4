//! Behaviour of stage → production reconciliation against the in-memory warehouse.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use media_etl_core::{
    CellValue, EtlConfig, EtlError, MemoryWarehouse, MergeTarget, ReconcileStep, RecordBatch,
    StageMergeReconciler, TableRef, WarehouseStore,
};
use proptest::prelude::*;

// =========================================================================
// FIXTURES
// =========================================================================

fn target() -> MergeTarget {
    MergeTarget::new(
        TableRef::new("staging", "episode_views_stage").unwrap(),
        TableRef::new("public", "episode_views").unwrap(),
        vec!["key".into()],
        vec!["views".into()],
    )
    .unwrap()
}

fn batch(rows: &[(i64, i64)]) -> RecordBatch {
    RecordBatch::new(
        vec!["key".into(), "views".into()],
        rows.iter()
            .map(|(k, v)| vec![CellValue::Int(*k), CellValue::Int(*v)])
            .collect(),
    )
    .unwrap()
}

async fn seeded(production: &[(i64, i64)]) -> Arc<MemoryWarehouse> {
    let store = Arc::new(MemoryWarehouse::new());
    let t = target();
    store.create_table(t.staging(), &["key", "views"]).await;
    store.create_table(t.production(), &["key", "views"]).await;
    if !production.is_empty() {
        store.append_rows(t.production(), &batch(production)).await.unwrap();
    }
    store
}

async fn production_map(store: &MemoryWarehouse) -> BTreeMap<i64, Vec<i64>> {
    let mut map: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for row in store.rows(target().production()).await {
        match (&row[0], &row[1]) {
            (CellValue::Int(k), CellValue::Int(v)) => map.entry(*k).or_default().push(*v),
            other => panic!("unexpected row {other:?}"),
        }
    }
    map
}

fn reconciler(store: &Arc<MemoryWarehouse>) -> StageMergeReconciler {
    StageMergeReconciler::new(store.clone(), target(), &EtlConfig::default())
}

// =========================================================================
// SCENARIOS
// =========================================================================

#[tokio::test]
async fn changed_row_is_updated_in_place() {
    let store = seeded(&[(1, 7)]).await;
    let outcome = reconciler(&store).publish(&batch(&[(1, 10)])).await.unwrap();

    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.deleted_from_staging, 1);
    assert_eq!(outcome.inserted, 0);
    assert!(outcome.staging_empty);
    assert_eq!(production_map(&store).await, BTreeMap::from([(1, vec![10])]));
    assert!(store.rows(target().staging()).await.is_empty());
}

#[tokio::test]
async fn new_key_is_inserted() {
    let store = seeded(&[(1, 7)]).await;
    let outcome = reconciler(&store).publish(&batch(&[(2, 5)])).await.unwrap();

    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.inserted, 1);
    assert_eq!(
        production_map(&store).await,
        BTreeMap::from([(1, vec![7]), (2, vec![5])])
    );
    assert!(store.rows(target().staging()).await.is_empty());
}

#[tokio::test]
async fn identical_row_is_dropped_from_staging_without_insert() {
    let store = seeded(&[(1, 7)]).await;
    let outcome = reconciler(&store).publish(&batch(&[(1, 7)])).await.unwrap();

    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.deleted_from_staging, 1);
    assert_eq!(outcome.inserted, 0);
    assert_eq!(production_map(&store).await, BTreeMap::from([(1, vec![7])]));
}

#[tokio::test]
async fn mixed_batch_updates_keeps_and_inserts() {
    let store = seeded(&[(1, 7), (2, 2), (3, 3)]).await;
    let outcome = reconciler(&store)
        .publish(&batch(&[(1, 8), (2, 2), (4, 4)]))
        .await
        .unwrap();

    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.deleted_from_staging, 2);
    assert_eq!(outcome.inserted, 1);
    assert_eq!(
        production_map(&store).await,
        BTreeMap::from([(1, vec![8]), (2, vec![2]), (3, vec![3]), (4, vec![4])])
    );
}

#[tokio::test]
async fn reconcile_on_empty_staging_is_a_no_op() {
    let store = seeded(&[(1, 7)]).await;
    let mut reconciler = reconciler(&store);

    reconciler.publish(&batch(&[(2, 5)])).await.unwrap();
    let before = production_map(&store).await;
    let second = reconciler.reconcile().await.unwrap();

    assert_eq!(second.updated, 0);
    assert_eq!(second.deleted_from_staging, 0);
    assert_eq!(second.inserted, 0);
    assert!(second.staging_empty);
    assert_eq!(production_map(&store).await, before);
}

#[tokio::test]
async fn reconcile_without_any_tables_succeeds() {
    let store = Arc::new(MemoryWarehouse::new());
    let outcome = reconciler(&store).reconcile().await.unwrap();
    assert!(outcome.staging_empty);
    assert_eq!(outcome.inserted, 0);
}

#[tokio::test]
async fn key_only_target_deduplicates() {
    let store = Arc::new(MemoryWarehouse::new());
    let t = MergeTarget::new(
        TableRef::new("staging", "titles_stage").unwrap(),
        TableRef::new("public", "titles").unwrap(),
        vec!["key".into(), "views".into()],
        vec![],
    )
    .unwrap();
    let mut reconciler = StageMergeReconciler::new(store.clone(), t.clone(), &EtlConfig::default());

    reconciler.publish(&batch(&[(1, 1), (2, 2)])).await.unwrap();
    let outcome = reconciler.publish(&batch(&[(2, 2), (3, 3)])).await.unwrap();

    assert_eq!(outcome.inserted, 1);
    assert_eq!(store.rows(t.production()).await.len(), 3);
}

#[tokio::test]
async fn failure_at_any_step_leaves_both_tables_untouched() {
    for step in [
        ReconcileStep::Update,
        ReconcileStep::Delete,
        ReconcileStep::Insert,
        ReconcileStep::Truncate,
    ] {
        let store = seeded(&[(1, 7)]).await;
        let mut reconciler = reconciler(&store);
        reconciler.stage(&batch(&[(1, 10), (2, 5)])).await.unwrap();
        let staged = store.rows(target().staging()).await;

        store.fail_next_merge_at(step).await;
        assert!(reconciler.reconcile().await.is_err(), "step {step}");

        assert_eq!(production_map(&store).await, BTreeMap::from([(1, vec![7])]));
        assert_eq!(store.rows(target().staging()).await, staged, "step {step}");
    }
}

#[tokio::test]
async fn retry_after_failure_does_not_double_stage() {
    let store = seeded(&[]).await;
    let mut reconciler = reconciler(&store);
    reconciler.stage(&batch(&[(1, 10)])).await.unwrap();
    store.fail_next_merge_at(ReconcileStep::Insert).await;
    assert!(reconciler.reconcile().await.is_err());

    let outcome = reconciler.publish(&batch(&[(1, 10)])).await.unwrap();

    assert_eq!(outcome.inserted, 1);
    assert_eq!(production_map(&store).await, BTreeMap::from([(1, vec![10])]));
}

#[tokio::test]
async fn stale_rows_from_a_crashed_run_are_discarded() {
    let store = seeded(&[]).await;
    store
        .append_rows(target().staging(), &batch(&[(9, 9)]))
        .await
        .unwrap();

    let outcome = reconciler(&store).publish(&batch(&[(1, 1)])).await.unwrap();

    assert_eq!(outcome.inserted, 1);
    assert_eq!(production_map(&store).await, BTreeMap::from([(1, vec![1])]));
}

#[tokio::test]
async fn repeated_key_in_one_batch_never_reaches_production() {
    let store = seeded(&[]).await;
    let err = reconciler(&store)
        .publish(&batch(&[(1, 10), (1, 11)]))
        .await
        .unwrap_err();

    assert!(matches!(err, EtlError::InvalidBatch(_)));
    assert!(production_map(&store).await.is_empty());
    assert!(store.rows(target().staging()).await.is_empty());
}

#[tokio::test]
async fn repeated_key_across_stage_calls_is_refused() {
    let store = seeded(&[(1, 7)]).await;
    let mut reconciler = reconciler(&store);
    reconciler.stage(&batch(&[(2, 5)])).await.unwrap();

    let err = reconciler.stage(&batch(&[(3, 3), (2, 6)])).await.unwrap_err();
    assert!(matches!(err, EtlError::InvalidBatch(_)));

    let outcome = reconciler.reconcile().await.unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(
        production_map(&store).await,
        BTreeMap::from([(1, vec![7]), (2, vec![5])])
    );
}

// =========================================================================
// PROPERTIES
// =========================================================================

fn distinct_rows() -> impl Strategy<Value = BTreeMap<i64, i64>> {
    prop::collection::btree_map(0i64..20, 0i64..5, 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn production_matches_staged_values_with_one_row_per_key(
        existing in distinct_rows(),
        rows in prop::collection::vec((0i64..20, 0i64..5), 1..12),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (published, production, staging_left) = runtime.block_on(async {
            let seed: Vec<(i64, i64)> = existing.iter().map(|(k, v)| (*k, *v)).collect();
            let store = seeded(&seed).await;
            let published = reconciler(&store).publish(&batch(&rows)).await;
            (
                published,
                production_map(&store).await,
                store.rows(target().staging()).await.len(),
            )
        });

        prop_assert_eq!(staging_left, 0);
        for (key, values) in &production {
            prop_assert_eq!(values.len(), 1, "key {} duplicated", key);
        }

        let distinct: BTreeSet<i64> = rows.iter().map(|(k, _)| *k).collect();
        if distinct.len() < rows.len() {
            prop_assert!(matches!(published, Err(EtlError::InvalidBatch(_))));
            let untouched: BTreeMap<i64, Vec<i64>> =
                existing.iter().map(|(k, v)| (*k, vec![*v])).collect();
            prop_assert_eq!(production, untouched);
            return Ok(());
        }
        prop_assert!(published.is_ok());

        let staged: BTreeMap<i64, i64> = rows.iter().copied().collect();
        for (key, value) in &staged {
            prop_assert_eq!(production.get(key), Some(&vec![*value]));
        }
        for (key, value) in &existing {
            if !staged.contains_key(key) {
                prop_assert_eq!(production.get(key), Some(&vec![*value]));
            }
        }
    }
}
