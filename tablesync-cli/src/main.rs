//! tablesync CLI: incremental sync of vendor tables into CSV or SQLite.
//!
//! Commands:
//! - `sync`: fetch rows newer than each table's stored watermark and merge them
//! - `tables`: list the table catalog
//! - `status`: stored watermark per table

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use polars::prelude::DataFrame;
use std::path::PathBuf;
use std::sync::Arc;
use tablesync_core::vendor::CircuitBreaker;
use tablesync_core::{Catalog, DateOverrides, EndPolicy, StorageKind, SyncWindow};
use tablesync_runner::{
    StagingArea, SyncConfig, SyncProgress, SyncReport, Synchronizer, TableOutcome, TableReport,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "tablesync",
    version,
    about = "tablesync: incremental sync of Sharadar tables into CSV or SQLite"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new rows for the selected tables and merge them into storage.
    Sync(SyncArgs),
    /// List the tables this tool can sync.
    Tables,
    /// Show the stored watermark of every table.
    Status(StoreArgs),
}

/// Where tables are stored. Flags override the config file.
#[derive(Args)]
struct StoreArgs {
    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage backend: csv or sqlite.
    #[arg(long)]
    storage: Option<StorageKind>,

    /// Directory holding CSV files or the database. Defaults to ./data.
    #[arg(long)]
    directory: Option<PathBuf>,

    /// CSV file prefix / database name (e.g. `mytest` -> data/mytest.db).
    #[arg(long)]
    save_name: Option<String>,
}

#[derive(Args)]
struct SyncArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Tables to sync (e.g. SEP EVENTS), or ALL. Defaults to the config, then all tables.
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    tables: Vec<String>,

    /// First date to request (YYYY-MM-DD). Defaults to the day after the stored watermark.
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Last date to request (YYYY-MM-DD). Defaults per --end-policy.
    #[arg(long)]
    to: Option<NaiveDate>,

    /// End date when --to is not given.
    #[arg(long, value_enum)]
    end_policy: Option<EndPolicyArg>,

    /// Rows of each fetched table to print.
    #[arg(long)]
    display_rows: Option<usize>,

    /// Nasdaq Data Link API key. Overrides config, env and key.txt.
    #[arg(long)]
    api_key: Option<String>,

    /// Write a JSON run report to this path.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EndPolicyArg {
    Today,
    Yesterday,
}

impl From<EndPolicyArg> for EndPolicy {
    fn from(arg: EndPolicyArg) -> Self {
        match arg {
            EndPolicyArg::Today => EndPolicy::Today,
            EndPolicyArg::Yesterday => EndPolicy::Yesterday,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tablesync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => run_sync(args),
        Commands::Tables => {
            print_catalog(&Catalog::sharadar());
            Ok(())
        }
        Commands::Status(args) => run_status(&args),
    }
}

fn load_config(args: &StoreArgs) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(kind) = args.storage {
        config.storage.kind = kind;
    }
    if let Some(dir) = &args.directory {
        config.storage.directory = dir.clone();
    }
    if let Some(name) = &args.save_name {
        config.storage.save_name = Some(name.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Config file overlaid by sync flags.
fn sync_config(args: &SyncArgs) -> Result<SyncConfig> {
    let mut config = load_config(&args.store)?;
    if !args.tables.is_empty() {
        config.tables = args.tables.clone();
    }
    if let Some(policy) = args.end_policy {
        config.end_policy = policy.into();
    }
    if let Some(rows) = args.display_rows {
        config.display_rows = rows;
    }
    if let Some(key) = &args.api_key {
        config.api_key = Some(key.clone());
    }
    Ok(config)
}

fn run_sync(args: SyncArgs) -> Result<()> {
    let config = sync_config(&args)?;
    let api_key = config.resolve_api_key()?;

    let circuit_breaker = Arc::new(CircuitBreaker::default_vendor());
    let client = config.data_link_client(api_key, circuit_breaker)?;
    let store = config.open_store();
    let catalog = Catalog::sharadar();
    let progress = ConsoleProgress {
        display_rows: config.display_rows,
    };

    let overrides = DateOverrides {
        from_date: args.from,
        to_date: args.to,
    };

    let synchronizer = Synchronizer::new(
        &catalog,
        store.as_ref(),
        &client,
        StagingArea::new(config.staging_dir()),
    )
    .with_resolver(config.resolver())
    .with_partition_size(config.partition_size())
    .with_storage_kind(config.storage.kind)
    .with_progress(&progress);

    let report = synchronizer
        .run(&config.tables, &overrides)
        .with_context(|| format!("Sync into {} stopped", store.describe()))?;

    if let Some(path) = &args.report {
        report.write_json(path)?;
        println!("Report written to: {}", path.display());
    }

    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_status(args: &StoreArgs) -> Result<()> {
    let config = load_config(args)?;
    let store = config.open_store();
    let catalog = Catalog::sharadar();

    println!("Storage: {}", store.describe());
    println!();
    println!("{:<8} {:<13} {:<12}", "Table", "Column", "Stored through");
    println!("{}", "-".repeat(36));
    for table in catalog.iter() {
        let watermark = store
            .read_watermark(table)
            .with_context(|| format!("Failed to read {}", table.id))?;
        println!("{:<8} {:<13} {}", table.id, table.watermark.to_string(), watermark);
    }
    Ok(())
}

fn print_catalog(catalog: &Catalog) {
    println!("{:<8} {:<13} {:>6}  {:<11} Description", "Table", "Column", "Weight", "Fetch");
    println!("{}", "-".repeat(72));
    for table in catalog.iter() {
        let fetch = if table.is_partitioned() {
            "by ticker"
        } else {
            "whole"
        };
        println!(
            "{:<8} {:<13} {:>6}  {:<11} {}",
            table.id,
            table.watermark.to_string(),
            table.chunk_weight,
            fetch,
            table.label
        );
    }
}

/// Prints progress and a preview of fetched rows to stdout.
struct ConsoleProgress {
    display_rows: usize,
}

impl SyncProgress for ConsoleProgress {
    fn on_table_start(&self, table: &str, index: usize, total: usize, window: &SyncWindow) {
        println!("[{}/{}] {table}: {window}", index + 1, total);
    }

    fn on_batch(&self, table: &str, batch: usize, batches: usize, error: Option<&str>) {
        if let Some(error) = error {
            println!("  FAIL: {table} batch {}/{batches}: {error}", batch + 1);
        }
    }

    fn on_fetched(&self, _table: &str, rows: &DataFrame) {
        if self.display_rows == 0 {
            return;
        }
        println!("{}", rows.head(Some(self.display_rows)));
        if rows.height() > self.display_rows {
            println!("...");
            println!("{}", rows.tail(Some(self.display_rows)));
        }
    }

    fn on_table_complete(&self, report: &TableReport) {
        match &report.outcome {
            TableOutcome::Failed { reason } => println!("  FAIL: {}: {reason}", report.table),
            outcome => println!("  {}: {outcome}", report.table),
        }
    }

    fn on_run_complete(&self, report: &SyncReport) {
        println!(
            "\nSync complete: {} tables, {} rows written, {} failed",
            report.tables.len(),
            report.total_rows(),
            report.failed_count()
        );
    }
}
