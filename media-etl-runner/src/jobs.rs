//! Job pipelines run by the process handler.
//!
//! Each job is a chain of explicit stages (extract → transform → load) that
//! hand their output to the next stage as a value.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use media_etl_core::{
    classify_day, DailyFunnelReport, EtlConfig, FunnelEventSource, MemoryWarehouse, MergeTarget,
    ObservationWindow, PgWarehouse, RawFunnelEvent, RecordBatch, ReconciliationOutcome,
    StageMergeReconciler, TableRef, WarehouseStore,
};

/// Suffix appended to a production table name to get its staging table.
pub const STAGING_SUFFIX: &str = "_stage";

/// Read raw funnel events from a JSON array or a JSON-lines file.
pub fn read_events_file(path: &Path) -> Result<Vec<RawFunnelEvent>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read events file {}", path.display()))?;
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse events in {}", path.display()));
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid event", path.display(), n + 1))
        })
        .collect()
}

/// Read a JSON array of uniform objects as a record batch.
pub fn read_rows_file(path: &Path) -> Result<RecordBatch> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read rows file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse rows in {}", path.display()))?;
    Ok(RecordBatch::from_json_rows(&value)?)
}

/// Store that publish stages write to.
///
/// A dry run never touches the store, so it gets an in-memory one and needs
/// no reachable warehouse. Otherwise `warehouse` is reused when already open.
pub async fn open_store(
    config: &EtlConfig,
    warehouse: Option<PgWarehouse>,
) -> Result<Arc<dyn WarehouseStore>> {
    if config.dry_run {
        return Ok(Arc::new(MemoryWarehouse::new()));
    }
    let pg = match warehouse {
        Some(pg) => pg,
        None => PgWarehouse::connect(config)
            .await
            .context("Failed to connect to the warehouse")?,
    };
    Ok(Arc::new(pg))
}

// ---------------------------------------------------------------------------
// Signup funnel
// ---------------------------------------------------------------------------

pub async fn extract_funnel_events(
    source: &dyn FunnelEventSource,
    table: &TableRef,
    day: NaiveDate,
) -> Result<Vec<RawFunnelEvent>> {
    let window = ObservationWindow::for_day(day);
    let events = source
        .load_funnel_events(table, &window)
        .await
        .with_context(|| format!("Failed to extract funnel events from {table}"))?;
    tracing::info!(
        table = %table,
        events = events.len(),
        start = %window.start,
        end = %window.end,
        "funnel events extracted"
    );
    Ok(events)
}

pub fn transform_funnel_events(events: Vec<RawFunnelEvent>, day: NaiveDate) -> DailyFunnelReport {
    classify_day(events, day)
}

/// Publish the report into `table` (production schema) through `<table>_stage`.
pub async fn load_funnel_report(
    store: Arc<dyn WarehouseStore>,
    config: &EtlConfig,
    report: &DailyFunnelReport,
    table: &str,
) -> Result<ReconciliationOutcome> {
    let target = MergeTarget::from_config(
        config,
        &format!("{table}{STAGING_SUFFIX}"),
        table,
        DailyFunnelReport::NATURAL_KEY.map(String::from).to_vec(),
        DailyFunnelReport::VALUE_COLUMNS.map(String::from).to_vec(),
    )?;
    let rows = report.to_record_batch()?;
    publish_rows(store, config, target, &rows).await
}

// ---------------------------------------------------------------------------
// Generic publish
// ---------------------------------------------------------------------------

pub async fn publish_rows(
    store: Arc<dyn WarehouseStore>,
    config: &EtlConfig,
    target: MergeTarget,
    rows: &RecordBatch,
) -> Result<ReconciliationOutcome> {
    let production = target.production().clone();
    let mut reconciler = StageMergeReconciler::new(store, target, config);
    reconciler
        .publish(rows)
        .await
        .with_context(|| format!("Failed to publish {} rows into {production}", rows.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_etl_core::{CellValue, JourneyOutcome, StaticEventSource};
    use std::io::Write;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
    }

    const EVENTS: &str = r#"[
        {"event_timestamp": "2024-03-05 10:00:00", "anonymous_id": "a", "user_tier": "anon", "state": "entered", "step": 1},
        {"event_timestamp": "2024-03-05 10:02:00", "anonymous_id": "a", "user_tier": "free", "state": "entered", "step": 4},
        {"event_timestamp": "2024-03-05 11:00:00", "anonymous_id": "b", "user_tier": "anon", "state": "entered", "step": 1}
    ]"#;

    #[test]
    fn events_file_accepts_array_and_lines() {
        let mut array = tempfile::NamedTempFile::new().unwrap();
        array.write_all(EVENTS.as_bytes()).unwrap();
        assert_eq!(read_events_file(array.path()).unwrap().len(), 3);

        let mut lines = tempfile::NamedTempFile::new().unwrap();
        writeln!(lines, r#"{{"anonymous_id": "a", "step": 1}}"#).unwrap();
        writeln!(lines).unwrap();
        writeln!(lines, r#"{{"anonymous_id": "b", "step": 2}}"#).unwrap();
        let events = read_events_file(lines.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].step, Some(2));
    }

    #[test]
    fn rows_file_becomes_a_batch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"[{"key": 1, "views": 10}, {"key": 2, "views": 20}]"#)
            .unwrap();
        let batch = read_rows_file(file.path()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.value(1, "views"), Some(&CellValue::Int(20)));
    }

    #[tokio::test]
    async fn funnel_job_publishes_rollup() {
        let events: Vec<RawFunnelEvent> = serde_json::from_str(EVENTS).unwrap();
        let source = StaticEventSource::new(events);
        let store = Arc::new(MemoryWarehouse::new());
        let config = EtlConfig::default();
        let table = TableRef::new("events", "signup_funnel").unwrap();

        let extracted = extract_funnel_events(&source, &table, day()).await.unwrap();
        let report = transform_funnel_events(extracted, day());
        let outcome = load_funnel_report(store.clone(), &config, &report, "signup_funnel_daily")
            .await
            .unwrap();

        assert_eq!(report.count(JourneyOutcome::AnonToFree), 1);
        assert_eq!(report.count(JourneyOutcome::AnonBounce), 1);
        assert_eq!(outcome.inserted, JourneyOutcome::ALL.len() as u64);

        let published = store
            .snapshot(&TableRef::new("public", "signup_funnel_daily").unwrap())
            .await
            .unwrap();
        assert_eq!(published.len(), JourneyOutcome::ALL.len());

        // Re-running the same day refreshes in place instead of duplicating.
        let rerun = load_funnel_report(store.clone(), &config, &report, "signup_funnel_daily")
            .await
            .unwrap();
        assert_eq!(rerun.inserted, 0);
        assert_eq!(rerun.updated, 0);
    }

    #[tokio::test]
    async fn dry_run_publishes_without_a_warehouse() {
        let config = EtlConfig {
            database_url: "postgresql://nowhere.invalid:1/warehouse".to_string(),
            ..EtlConfig::default()
        }
        .with_dry_run(true);
        let report = transform_funnel_events(serde_json::from_str(EVENTS).unwrap(), day());

        let store = open_store(&config, None).await.unwrap();
        let outcome = load_funnel_report(store, &config, &report, "signup_funnel_daily")
            .await
            .unwrap();

        assert!(outcome.dry_run);
        assert_eq!(outcome.inserted, 0);
    }

    #[tokio::test]
    async fn local_mode_publishes_into_sandbox() {
        let store = Arc::new(MemoryWarehouse::new());
        let config = EtlConfig::default().with_local_mode(true);
        let report = transform_funnel_events(serde_json::from_str(EVENTS).unwrap(), day());

        load_funnel_report(store.clone(), &config, &report, "signup_funnel_daily")
            .await
            .unwrap();

        let sandbox = TableRef::new("sandbox", "signup_funnel_daily").unwrap();
        let public = TableRef::new("public", "signup_funnel_daily").unwrap();
        assert_eq!(store.rows(&sandbox).await.len(), JourneyOutcome::ALL.len());
        assert!(store.rows(&public).await.is_empty());
    }
}
