//! In-memory warehouse for tests and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{EtlError, Result};
use crate::journey::{ObservationWindow, RawFunnelEvent};
use crate::reconcile::{MergeTarget, ReconcileStep, ReconciliationOutcome};
use crate::record::{CellValue, RecordBatch, TableRef};
use crate::store::{FunnelEventSource, WarehouseStore};

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl MemoryTable {
    fn indices(&self, table: &TableRef, columns: &[String]) -> Result<Vec<usize>> {
        columns
            .iter()
            .map(|c| {
                self.columns.iter().position(|own| own == c).ok_or_else(|| {
                    EtlError::Warehouse(format!("column {c} does not exist in {table}"))
                })
            })
            .collect()
    }
}

fn project<'a>(row: &'a [CellValue], indices: &[usize]) -> Vec<&'a CellValue> {
    indices.iter().map(|i| &row[*i]).collect()
}

/// Tables held in process memory behind one lock.
///
/// `merge_staged` works on copies of both tables and only writes them back
/// when every step succeeded, which gives it the same all-or-nothing
/// behaviour as the PostgreSQL transaction.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<TableRef, MemoryTable>>,
    fail_at: Mutex<Option<ReconcileStep>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, table: &TableRef, columns: &[&str]) {
        self.tables.lock().await.insert(
            table.clone(),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Current rows of `table`, empty when it does not exist.
    pub async fn rows(&self, table: &TableRef) -> Vec<Vec<CellValue>> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Current contents of `table` as a batch.
    pub async fn snapshot(&self, table: &TableRef) -> Option<RecordBatch> {
        let tables = self.tables.lock().await;
        let t = tables.get(table)?;
        RecordBatch::new(t.columns.clone(), t.rows.clone()).ok()
    }

    /// Make the next `merge_staged` fail when it reaches `step`.
    pub async fn fail_next_merge_at(&self, step: ReconcileStep) {
        *self.fail_at.lock().await = Some(step);
    }
}

#[async_trait]
impl WarehouseStore for MemoryWarehouse {
    async fn append_rows(&self, table: &TableRef, batch: &RecordBatch) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let entry = tables.entry(table.clone()).or_insert_with(|| MemoryTable {
            columns: batch.columns().to_vec(),
            rows: Vec::new(),
        });
        let indices = batch
            .columns()
            .iter()
            .map(|c| {
                entry.columns.iter().position(|own| own == c).ok_or_else(|| {
                    EtlError::Warehouse(format!("column {c} does not exist in {table}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if indices.len() != entry.columns.len() {
            return Err(EtlError::Warehouse(format!(
                "batch has {} columns, {table} has {}",
                indices.len(),
                entry.columns.len()
            )));
        }

        for row in batch.rows() {
            let mut stored = vec![CellValue::Null; entry.columns.len()];
            for (value, index) in row.iter().zip(&indices) {
                stored[*index] = value.clone();
            }
            entry.rows.push(stored);
        }
        Ok(batch.len() as u64)
    }

    async fn truncate(&self, table: &TableRef) -> Result<()> {
        if let Some(t) = self.tables.lock().await.get_mut(table) {
            t.rows.clear();
        }
        Ok(())
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64> {
        Ok(self
            .tables
            .lock()
            .await
            .get(table)
            .map_or(0, |t| t.rows.len() as u64))
    }

    async fn merge_staged(&self, target: &MergeTarget) -> Result<ReconciliationOutcome> {
        let mut tables = self.tables.lock().await;
        let fail_at = self.fail_at.lock().await.take();
        let check = |step: ReconcileStep| match fail_at {
            Some(armed) if armed == step => Err(EtlError::Warehouse(format!(
                "injected failure at {step}"
            ))),
            _ => Ok(()),
        };

        let staging_ref = target.staging();
        let production_ref = target.production();
        let staging_exists = tables.contains_key(staging_ref);
        let mut staging = tables.get(staging_ref).cloned().unwrap_or_default();
        let mut production = tables
            .get(production_ref)
            .cloned()
            .unwrap_or_else(|| MemoryTable {
                columns: staging.columns.clone(),
                rows: Vec::new(),
            });

        let mut outcome = ReconciliationOutcome::default();

        if !staging.rows.is_empty() {
            let stage_keys = staging.indices(staging_ref, target.natural_key())?;
            let prod_keys = production.indices(production_ref, target.natural_key())?;

            if !target.value_columns().is_empty() {
                check(ReconcileStep::Update)?;
                let stage_values = staging.indices(staging_ref, target.value_columns())?;
                let prod_values = production.indices(production_ref, target.value_columns())?;
                for prod_row in production.rows.iter_mut() {
                    let key = project(prod_row, &prod_keys);
                    let Some(stage_row) = staging
                        .rows
                        .iter()
                        .find(|s| project(s, &stage_keys) == key)
                    else {
                        continue;
                    };
                    let fresh: Vec<CellValue> = project(stage_row, &stage_values)
                        .into_iter()
                        .cloned()
                        .collect();
                    let changed = prod_values
                        .iter()
                        .zip(&fresh)
                        .any(|(i, v)| prod_row[*i] != *v);
                    if changed {
                        for (i, v) in prod_values.iter().zip(fresh) {
                            prod_row[*i] = v;
                        }
                        outcome.updated += 1;
                    }
                }
            } else {
                check(ReconcileStep::Update)?;
            }

            check(ReconcileStep::Delete)?;
            let before = staging.rows.len();
            staging.rows.retain(|s| {
                let key = project(s, &stage_keys);
                !production
                    .rows
                    .iter()
                    .any(|p| project(p, &prod_keys) == key)
            });
            outcome.deleted_from_staging = (before - staging.rows.len()) as u64;

            check(ReconcileStep::Insert)?;
            let mapping = production.indices(production_ref, &staging.columns)?;
            if mapping.len() != production.columns.len() {
                return Err(EtlError::Warehouse(format!(
                    "{staging_ref} and {production_ref} have different columns"
                )));
            }
            for row in staging.rows.drain(..) {
                let mut stored = vec![CellValue::Null; production.columns.len()];
                for (value, index) in row.into_iter().zip(&mapping) {
                    stored[*index] = value;
                }
                production.rows.push(stored);
                outcome.inserted += 1;
            }
        } else {
            check(ReconcileStep::Update)?;
            check(ReconcileStep::Delete)?;
            check(ReconcileStep::Insert)?;
        }

        check(ReconcileStep::Truncate)?;
        staging.rows.clear();
        outcome.staging_empty = staging.rows.is_empty();

        if staging_exists {
            tables.insert(staging_ref.clone(), staging);
        }
        if tables.contains_key(production_ref) || !production.rows.is_empty() {
            tables.insert(production_ref.clone(), production);
        }
        Ok(outcome)
    }
}

/// Fixed list of raw funnel events, filtered by window like a warehouse query.
#[derive(Debug, Clone, Default)]
pub struct StaticEventSource {
    events: Vec<RawFunnelEvent>,
}

impl StaticEventSource {
    pub fn new(events: Vec<RawFunnelEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl FunnelEventSource for StaticEventSource {
    async fn load_funnel_events(
        &self,
        _table: &TableRef,
        window: &ObservationWindow,
    ) -> Result<Vec<RawFunnelEvent>> {
        let mut events: Vec<RawFunnelEvent> = self
            .events
            .iter()
            .filter(|e| e.event_timestamp.is_some_and(|ts| window.contains(ts)))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.event_timestamp);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> TableRef {
        TableRef::new("public", name).unwrap()
    }

    #[tokio::test]
    async fn append_creates_table_and_reorders_columns() {
        let store = MemoryWarehouse::new();
        let t = table("views");
        store.create_table(&t, &["key", "views"]).await;

        let batch = RecordBatch::new(
            vec!["views".into(), "key".into()],
            vec![vec![CellValue::Int(10), CellValue::Int(1)]],
        )
        .unwrap();
        store.append_rows(&t, &batch).await.unwrap();

        assert_eq!(
            store.rows(&t).await,
            vec![vec![CellValue::Int(1), CellValue::Int(10)]]
        );
    }

    #[tokio::test]
    async fn append_with_unknown_column_fails() {
        let store = MemoryWarehouse::new();
        let t = table("views");
        store.create_table(&t, &["key", "views"]).await;
        let batch =
            RecordBatch::new(vec!["plays".into()], vec![vec![CellValue::Int(1)]]).unwrap();
        assert!(store.append_rows(&t, &batch).await.is_err());
    }

    #[tokio::test]
    async fn truncate_and_count() {
        let store = MemoryWarehouse::new();
        let t = table("views");
        let batch = RecordBatch::new(vec!["key".into()], vec![vec![CellValue::Int(1)]]).unwrap();
        store.append_rows(&t, &batch).await.unwrap();
        assert_eq!(store.count_rows(&t).await.unwrap(), 1);
        store.truncate(&t).await.unwrap();
        assert_eq!(store.count_rows(&t).await.unwrap(), 0);
        assert_eq!(store.count_rows(&table("missing")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn static_source_applies_window() {
        use crate::journey::parse_timestamp;
        use chrono::NaiveDate;

        let event = |ts: &str| RawFunnelEvent {
            event_timestamp: parse_timestamp(ts),
            ..RawFunnelEvent::default()
        };
        let source = StaticEventSource::new(vec![
            event("2024-03-05 10:00:00"),
            event("2024-03-06 00:00:00"),
            event("2024-03-04 10:00:00"),
            RawFunnelEvent::default(),
        ]);
        let window = ObservationWindow::for_day(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());

        let events = source.load_funnel_events(&table("events"), &window).await.unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_timestamp, parse_timestamp("2024-03-04 10:00:00"));
    }
}
