//! PostgreSQL warehouse adapter.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};

use crate::config::EtlConfig;
use crate::error::Result;
use crate::journey::{ObservationWindow, RawFunnelEvent};
use crate::merge_sql::MergeStatements;
use crate::reconcile::{MergeTarget, ReconcileStep, ReconciliationOutcome};
use crate::record::{quote_ident, CellValue, RecordBatch, TableRef};
use crate::store::{FunnelEventSource, WarehouseStore};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    /// Open a pool using the connection settings in `config`.
    ///
    /// `statement_timeout` is set on every connection, so a runaway merge is
    /// cancelled by the server and its transaction rolled back.
    pub async fn connect(config: &EtlConfig) -> Result<Self> {
        info!(
            "Connecting to warehouse: {}",
            mask_database_url(&config.database_url)
        );

        let options = PgConnectOptions::from_str(&config.database_url)?.options([(
            "statement_timeout",
            config.statement_timeout.as_millis().to_string(),
        )]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| {
                warn!("Failed to connect to warehouse: {}", e);
                e
            })?;

        info!("Warehouse connection pool created");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        info!("Closing warehouse connection pool");
        self.pool.close().await;
    }
}

fn push_cell(row: &mut Separated<'_, '_, Postgres, &'static str>, value: &CellValue) {
    // A typed NULL bind would be rejected by non-text columns; a literal adapts.
    match value {
        CellValue::Null => row.push("NULL"),
        CellValue::Bool(v) => row.push_bind(*v),
        CellValue::Int(v) => row.push_bind(*v),
        CellValue::Float(v) => row.push_bind(*v),
        CellValue::Text(v) => row.push_bind(v.clone()),
        CellValue::Date(v) => row.push_bind(*v),
        CellValue::Timestamp(v) => row.push_bind(*v),
    };
}

#[async_trait]
impl WarehouseStore for PgWarehouse {
    async fn append_rows(&self, table: &TableRef, batch: &RecordBatch) -> Result<u64> {
        let column_list = batch
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / batch.columns().len()).max(1);

        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for chunk in batch.rows().chunks(rows_per_statement) {
            let mut insert: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", table.quoted(), column_list));
            insert.push_values(chunk, |mut row, values| {
                for value in values {
                    push_cell(&mut row, value);
                }
            });
            written += insert.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn truncate(&self, table: &TableRef) -> Result<()> {
        let sql = format!("TRUNCATE TABLE {}", table.quoted());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.quoted());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn merge_staged(&self, target: &MergeTarget) -> Result<ReconciliationOutcome> {
        let statements = MergeStatements::for_target(target);
        let mut outcome = ReconciliationOutcome::default();

        // Dropping `tx` on an early return rolls everything back.
        let mut tx = self.pool.begin().await?;
        for (step, sql) in statements.in_order() {
            let affected = sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    warn!(target: "etl.reconcile", %step, error = %e, "statement failed");
                    e
                })?
                .rows_affected();
            match step {
                ReconcileStep::Update => outcome.updated = affected,
                ReconcileStep::Delete => outcome.deleted_from_staging = affected,
                ReconcileStep::Insert => outcome.inserted = affected,
                ReconcileStep::Truncate => {}
            }
        }
        let remaining: i64 = sqlx::query_scalar(&statements.verify)
            .fetch_one(&mut *tx)
            .await?;
        outcome.staging_empty = remaining == 0;
        tx.commit().await?;

        Ok(outcome)
    }
}

#[async_trait]
impl FunnelEventSource for PgWarehouse {
    async fn load_funnel_events(
        &self,
        table: &TableRef,
        window: &ObservationWindow,
    ) -> Result<Vec<RawFunnelEvent>> {
        let sql = format!(
            r#"
            SELECT event_timestamp::timestamp AS event_timestamp,
                   user_id::text AS user_id,
                   user_tier::text AS user_tier,
                   anonymous_id::text AS anonymous_id,
                   state::text AS state,
                   step::int4 AS step,
                   option_selected::text AS option_selected
            FROM {}
            WHERE event_timestamp >= $1 AND event_timestamp < $2
            ORDER BY event_timestamp
            "#,
            table.quoted()
        );
        let events = sqlx::query_as::<_, RawFunnelEvent>(&sql)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }
}

/// Mask the password in a database URL for logging.
pub fn mask_database_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        let mut masked = parsed.clone();
        if parsed.password().is_some() {
            let _ = masked.set_password(Some("***"));
        }
        masked.to_string()
    } else {
        let chars: Vec<char> = url.chars().collect();
        if chars.len() > 20 {
            let head: String = chars[..10].iter().collect();
            let tail: String = chars[chars.len() - 10..].iter().collect();
            format!("{head}***{tail}")
        } else {
            "***".to_string()
        }
    }
}
