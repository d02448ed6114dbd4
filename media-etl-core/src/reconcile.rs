//! Stage → production reconciliation.
//!
//! A job writes its freshly computed rows into a staging table, then one
//! transaction runs:
//!
//! ```text
//! UPDATE prod   ← staging   (key matches, values differ)
//! DELETE staging            (key matches prod; rows are now equal)
//! INSERT prod   ← staging   (only unseen keys remain)
//! TRUNCATE staging
//! ```
//!
//! Production rows that already equal the staged ones are never deleted, so
//! readers of production never observe a missing row.
//!
//! The first `stage` through a [`StageMergeReconciler`] clears whatever an
//! earlier crashed run left in staging. Later calls on the same instance
//! append, and `reconcile` starts a new run.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{EtlConfig, SchemaRole};
use crate::error::{EtlError, Result};
use crate::merge_sql::MergeStatements;
use crate::record::{validate_ident, CellValue, RecordBatch, TableRef};
use crate::store::WarehouseStore;

/// Natural key values of one row, rendered so that `Int(1)` and `Text("1")` differ.
type KeyTuple = Vec<String>;

fn key_tuple(row: &[CellValue], indices: &[usize]) -> KeyTuple {
    indices.iter().map(|i| format!("{:?}", row[*i])).collect()
}

/// Where and how a batch is merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTarget {
    staging: TableRef,
    production: TableRef,
    natural_key: Vec<String>,
    value_columns: Vec<String>,
}

impl MergeTarget {
    pub fn new(
        staging: TableRef,
        production: TableRef,
        natural_key: Vec<String>,
        value_columns: Vec<String>,
    ) -> Result<Self> {
        if natural_key.is_empty() {
            return Err(EtlError::InvalidTarget(
                "at least one natural key column is required".to_string(),
            ));
        }
        if staging == production {
            return Err(EtlError::InvalidTarget(format!(
                "staging and production are the same table ({staging})"
            )));
        }
        let mut seen = HashSet::new();
        for column in natural_key.iter().chain(value_columns.iter()) {
            validate_ident(column)?;
            if !seen.insert(column.as_str()) {
                return Err(EtlError::InvalidTarget(format!(
                    "column {column} is listed more than once"
                )));
            }
        }
        Ok(Self {
            staging,
            production,
            natural_key,
            value_columns,
        })
    }

    /// Resolve bare table names against the configured schemas.
    pub fn from_config(
        config: &EtlConfig,
        staging_table: &str,
        production_table: &str,
        natural_key: Vec<String>,
        value_columns: Vec<String>,
    ) -> Result<Self> {
        Self::new(
            TableRef::new(config.schema_for(SchemaRole::Staging), staging_table)?,
            TableRef::new(config.schema_for(SchemaRole::Production), production_table)?,
            natural_key,
            value_columns,
        )
    }

    pub fn staging(&self) -> &TableRef {
        &self.staging
    }

    pub fn production(&self) -> &TableRef {
        &self.production
    }

    pub fn natural_key(&self) -> &[String] {
        &self.natural_key
    }

    pub fn value_columns(&self) -> &[String] {
        &self.value_columns
    }

    /// Check that `batch` can be staged for this target: every column
    /// present, no NULL key cell, no key tuple repeated within the batch.
    pub fn check_batch(&self, batch: &RecordBatch) -> Result<()> {
        self.batch_keys(batch).map(|_| ())
    }

    /// Validate `batch` and return its key tuples in row order.
    fn batch_keys(&self, batch: &RecordBatch) -> Result<Vec<KeyTuple>> {
        let missing = |column: &String| {
            EtlError::InvalidBatch(format!(
                "batch for {} has no column {column}",
                self.staging
            ))
        };
        for column in &self.value_columns {
            if batch.column_index(column).is_none() {
                return Err(missing(column));
            }
        }
        let mut indices = Vec::with_capacity(self.natural_key.len());
        for key in &self.natural_key {
            let index = batch.column_index(key).ok_or_else(|| missing(key))?;
            if let Some(row) = batch.rows().iter().position(|r| r[index].is_null()) {
                return Err(EtlError::InvalidBatch(format!(
                    "row {row} has a NULL natural key column {key}"
                )));
            }
            indices.push(index);
        }

        let mut seen = HashSet::with_capacity(batch.len());
        let mut keys = Vec::with_capacity(batch.len());
        for (row, values) in batch.rows().iter().enumerate() {
            let key = key_tuple(values, &indices);
            if !seen.insert(key.clone()) {
                return Err(EtlError::InvalidBatch(format!(
                    "row {row} repeats natural key ({})",
                    key.join(", ")
                )));
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

/// One statement of the reconciliation transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStep {
    Update,
    Delete,
    Insert,
    Truncate,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Insert => "INSERT",
            Self::Truncate => "TRUNCATE",
        };
        f.write_str(name)
    }
}

/// Row counts of one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub updated: u64,
    pub deleted_from_staging: u64,
    pub inserted: u64,
    pub staging_empty: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl ReconciliationOutcome {
    fn dry_run() -> Self {
        Self {
            staging_empty: true,
            dry_run: true,
            ..Self::default()
        }
    }
}

/// Publishes one job's result set into one production table.
///
/// An instance covers a single run: create it, `stage` one or more batches,
/// then `reconcile`.
pub struct StageMergeReconciler {
    store: Arc<dyn WarehouseStore>,
    target: MergeTarget,
    dry_run: bool,
    run_started: bool,
    staged_keys: HashSet<KeyTuple>,
}

impl StageMergeReconciler {
    pub fn new(store: Arc<dyn WarehouseStore>, target: MergeTarget, config: &EtlConfig) -> Self {
        Self {
            store,
            target,
            dry_run: config.dry_run,
            run_started: false,
            staged_keys: HashSet::new(),
        }
    }

    pub fn target(&self) -> &MergeTarget {
        &self.target
    }

    /// Append `batch` to the staging table. Returns the number of rows written.
    ///
    /// A key already staged earlier in the same run is refused, so the
    /// INSERT step never sees two rows for one key.
    pub async fn stage(&mut self, batch: &RecordBatch) -> Result<u64> {
        let staging = self.target.staging();
        if batch.is_empty() {
            return Err(EtlError::EmptyBatch(staging.to_string()));
        }
        let keys = self.target.batch_keys(batch)?;
        if let Some(key) = keys.iter().find(|k| self.staged_keys.contains(*k)) {
            return Err(EtlError::InvalidBatch(format!(
                "natural key ({}) already staged for {staging} in this run",
                key.join(", ")
            )));
        }

        if self.dry_run {
            tracing::info!(
                target: "etl.stage",
                staging = %staging,
                rows = batch.len(),
                "dry run: batch not staged"
            );
            self.staged_keys.extend(keys);
            return Ok(0);
        }

        if !self.run_started {
            let stale = self.store.count_rows(staging).await?;
            if stale > 0 {
                tracing::warn!(
                    target: "etl.stage",
                    staging = %staging,
                    stale,
                    "discarding rows left by an unfinished run"
                );
                self.store.truncate(staging).await?;
            }
            self.run_started = true;
        }

        let written = self.store.append_rows(staging, batch).await?;
        self.staged_keys.extend(keys);
        tracing::debug!(target: "etl.stage", staging = %staging, written, "batch staged");
        Ok(written)
    }

    /// Merge staging into production and empty staging, all in one transaction.
    pub async fn reconcile(&mut self) -> Result<ReconciliationOutcome> {
        let staging = self.target.staging().clone();
        let production = self.target.production().clone();
        self.staged_keys.clear();

        if self.dry_run {
            for (step, sql) in MergeStatements::for_target(&self.target).in_order() {
                tracing::info!(
                    target: "etl.reconcile",
                    %step,
                    sql,
                    "dry run: statement not executed"
                );
            }
            return Ok(ReconciliationOutcome::dry_run());
        }

        self.run_started = false;
        let outcome = self.store.merge_staged(&self.target).await.map_err(|e| {
            tracing::error!(
                target: "etl.reconcile",
                staging = %staging,
                production = %production,
                error = %e,
                "reconciliation rolled back"
            );
            e
        })?;

        if !outcome.staging_empty {
            return Err(EtlError::Warehouse(format!(
                "staging table {staging} not empty after reconciliation"
            )));
        }

        tracing::info!(
            target: "etl.reconcile",
            staging = %staging,
            production = %production,
            updated = outcome.updated,
            deleted = outcome.deleted_from_staging,
            inserted = outcome.inserted,
            "reconciliation committed"
        );
        Ok(outcome)
    }

    /// `stage` followed by `reconcile`.
    pub async fn publish(&mut self, batch: &RecordBatch) -> Result<ReconciliationOutcome> {
        self.stage(batch).await?;
        self.reconcile().await
    }
}
