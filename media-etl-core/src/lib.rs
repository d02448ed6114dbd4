//! Media warehouse ETL core.
//!
//! Two pieces shared by the reporting jobs:
//!
//! - [`reconcile`]: publishes a freshly computed result set into a production
//!   table through a staging table, in one UPDATE/DELETE/INSERT/TRUNCATE
//!   transaction.
//! - [`journey`]: rebuilds each visitor's signup funnel session from raw
//!   events and classifies how it ended (bounce, upgrade, login).
//!
//! Both talk to the warehouse only through [`store::WarehouseStore`] and
//! [`store::FunnelEventSource`]. The PostgreSQL adapter is behind the
//! `postgres` feature; [`store_memory::MemoryWarehouse`] is always available.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use media_etl_core::{
//!     EtlConfig, MemoryWarehouse, MergeTarget, RecordBatch, StageMergeReconciler,
//! };
//!
//! # async fn run() -> media_etl_core::Result<()> {
//! let config = EtlConfig::from_env()?;
//! let target = MergeTarget::from_config(
//!     &config,
//!     "episode_views_stage",
//!     "episode_views",
//!     vec!["episode_id".into()],
//!     vec!["views".into()],
//! )?;
//! let rows = RecordBatch::from_json_rows(&serde_json::json!([{"episode_id": 1, "views": 10}]))?;
//! let store = Arc::new(MemoryWarehouse::new());
//! let mut reconciler = StageMergeReconciler::new(store, target, &config);
//! let outcome = reconciler.publish(&rows).await?;
//! assert!(outcome.staging_empty);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod journey;
pub mod merge_sql;
pub mod reconcile;
pub mod record;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;

pub use config::{EtlConfig, SchemaRole};
pub use error::{EtlError, Result};
pub use journey::{
    classify_day, DailyFunnelReport, Journey, JourneyAnomaly, JourneyOutcome, ObservationWindow,
    RawFunnelEvent, Tier, TransitionState,
};
pub use reconcile::{MergeTarget, ReconcileStep, ReconciliationOutcome, StageMergeReconciler};
pub use record::{CellValue, RecordBatch, TableRef};
pub use store::{FunnelEventSource, WarehouseStore};
pub use store_memory::{MemoryWarehouse, StaticEventSource};
#[cfg(feature = "postgres")]
pub use store_postgres::PgWarehouse;
