//! ETL process handler.
//!
//! Usage:
//!   etl-runner classify --day 2024-03-05 --events-table events.signup_funnel \
//!     --publish signup_funnel_daily
//!
//!   etl-runner classify --day 2024-03-05 --events extract.json --json
//!
//!   etl-runner --dry-run publish --rows episode_views.json \
//!     --target episode_views --key series --key episode --value views
//!
//! Configuration comes from the environment (and `.env`); see
//! `media_etl_core::config`. `--dry-run` and `--local` override it.

mod jobs;

use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use media_etl_core::journey::parse_target_day;
use media_etl_core::{
    DailyFunnelReport, EtlConfig, FunnelEventSource, MergeTarget, PgWarehouse, SchemaRole,
    StaticEventSource, TableRef,
};

#[derive(Parser, Debug)]
#[command(name = "etl-runner")]
#[command(about = "Run warehouse ETL jobs")]
struct Cli {
    /// Log the statements that would run instead of writing to the warehouse.
    /// No connection is opened unless events are read from a table.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Write into the local sandbox schema instead of staging/production
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify one day of signup funnel journeys
    Classify(ClassifyArgs),
    /// Stage rows from a JSON file and merge them into a production table
    Publish(PublishArgs),
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    /// Processing day (YYYY-MM-DD)
    #[arg(long, value_parser = parse_day)]
    day: NaiveDate,

    /// Raw events as a JSON array or JSON lines
    #[arg(long, conflicts_with = "events_table")]
    events: Option<PathBuf>,

    /// Warehouse table holding raw events (schema.table)
    #[arg(long)]
    events_table: Option<String>,

    /// Production table to publish the daily rollup into
    #[arg(long)]
    publish: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct PublishArgs {
    /// JSON array of row objects
    #[arg(long)]
    rows: PathBuf,

    /// Production table name
    #[arg(long)]
    target: String,

    /// Staging table name (default: <target>_stage)
    #[arg(long)]
    staging: Option<String>,

    /// Natural key column (repeatable)
    #[arg(long = "key", required = true)]
    keys: Vec<String>,

    /// Value column refreshed on conflict (repeatable)
    #[arg(long = "value")]
    values: Vec<String>,
}

fn parse_day(s: &str) -> Result<NaiveDate, String> {
    parse_target_day(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let base = EtlConfig::from_env()?;
    let config = EtlConfig {
        dry_run: base.dry_run || cli.dry_run,
        local_mode: base.local_mode || cli.local,
        ..base
    };
    tracing::info!(
        dry_run = config.dry_run,
        local_mode = config.local_mode,
        "etl-runner starting"
    );

    match cli.command {
        Command::Classify(args) => run_classify(&config, args).await,
        Command::Publish(args) => run_publish(&config, args).await,
    }
}

async fn run_classify(config: &EtlConfig, args: ClassifyArgs) -> Result<()> {
    let warehouse = if args.events_table.is_some() {
        Some(PgWarehouse::connect(config).await?)
    } else {
        None
    };

    let events = match (&args.events, &args.events_table, &warehouse) {
        (Some(path), None, _) => {
            let source = StaticEventSource::new(jobs::read_events_file(path)?);
            let table = TableRef::new("file", path.display().to_string())?;
            jobs::extract_funnel_events(&source, &table, args.day).await?
        }
        (None, Some(name), Some(pg)) => {
            let table = TableRef::parse(name, config.schema_for(SchemaRole::Production))?;
            jobs::extract_funnel_events(pg as &dyn FunnelEventSource, &table, args.day).await?
        }
        _ => bail!("pass exactly one of --events or --events-table"),
    };

    let report = jobs::transform_funnel_events(events, args.day);
    print_report(&report, args.json)?;

    if let Some(table) = &args.publish {
        let store = jobs::open_store(config, warehouse).await?;
        let outcome = jobs::load_funnel_report(store, config, &report, table).await?;
        println!(
            "Published into {table}: {} updated, {} inserted{}",
            outcome.updated,
            outcome.inserted,
            if outcome.dry_run { " (dry run)" } else { "" }
        );
    }
    Ok(())
}

async fn run_publish(config: &EtlConfig, args: PublishArgs) -> Result<()> {
    let rows = jobs::read_rows_file(&args.rows)?;
    let staging = args
        .staging
        .unwrap_or_else(|| format!("{}{}", args.target, jobs::STAGING_SUFFIX));
    let target = MergeTarget::from_config(config, &staging, &args.target, args.keys, args.values)?;

    let store = jobs::open_store(config, None).await?;
    let outcome = jobs::publish_rows(store, config, target, &rows).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn print_report(report: &DailyFunnelReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Signup funnel for {}", report.day);
    println!("  journeys:            {}", report.journeys_seen);
    println!("  malformed:           {}", report.malformed);
    println!("  orphan events:       {}", report.orphan_events);
    println!("  outside cohort:      {}", report.outside_cohort);
    println!("  identity collisions: {}", report.identity_collisions);
    println!("  unknown transitions: {}", report.unknown_transitions);
    println!("  unclassified:        {}", report.unclassified);
    for (outcome, count) in &report.outcomes {
        println!(
            "  {:<22} {:>6} (strict {})",
            outcome.as_str(),
            count,
            report.strict_count(*outcome)
        );
    }
    for (option, count) in &report.payment_options {
        println!("  payment {:<14} {:>6}", option, count);
    }
    Ok(())
}
