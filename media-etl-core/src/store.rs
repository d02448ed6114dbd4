use async_trait::async_trait;

use crate::error::Result;
use crate::journey::{ObservationWindow, RawFunnelEvent};
use crate::reconcile::{MergeTarget, ReconciliationOutcome};
use crate::record::{RecordBatch, TableRef};

/// Warehouse operations the ETL jobs depend on.
///
/// Jobs and the reconciler only talk to this trait, so the same code runs
/// against [`MemoryWarehouse`](crate::store_memory::MemoryWarehouse) in
/// tests and `PgWarehouse` in production.
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// Append rows to `table`. Returns the number of rows written.
    async fn append_rows(&self, table: &TableRef, batch: &RecordBatch) -> Result<u64>;

    async fn truncate(&self, table: &TableRef) -> Result<()>;

    async fn count_rows(&self, table: &TableRef) -> Result<u64>;

    /// Run UPDATE, DELETE, INSERT and TRUNCATE for `target` as one transaction.
    /// On error neither table is changed.
    async fn merge_staged(&self, target: &MergeTarget) -> Result<ReconciliationOutcome>;
}

/// Source of raw signup funnel events.
#[async_trait]
pub trait FunnelEventSource: Send + Sync {
    /// Events whose timestamp falls inside `window`, ordered by timestamp.
    /// Other fields are returned as stored; gaps surface as malformed events
    /// when journeys are built.
    async fn load_funnel_events(
        &self,
        table: &TableRef,
        window: &ObservationWindow,
    ) -> Result<Vec<RawFunnelEvent>>;
}
