//! Progress callbacks for a sync run.

use crate::report::{SyncReport, TableReport};
use polars::prelude::DataFrame;
use tablesync_core::SyncWindow;

/// Observer of a sync run. Every hook has a no-op default.
pub trait SyncProgress {
    /// A table is about to be fetched over `window`.
    fn on_table_start(&self, _table: &str, _index: usize, _total: usize, _window: &SyncWindow) {}

    /// One ticker batch finished; `error` is set when it failed.
    fn on_batch(&self, _table: &str, _batch: usize, _batches: usize, _error: Option<&str>) {}

    /// New rows for a table are staged and about to be merged.
    fn on_fetched(&self, _table: &str, _rows: &DataFrame) {}

    /// A table reached its final outcome.
    fn on_table_complete(&self, _report: &TableReport) {}

    /// The whole run is done.
    fn on_run_complete(&self, _report: &SyncReport) {}
}

/// Discards every event.
pub struct NoProgress;

impl SyncProgress for NoProgress {}

/// Emits each event as a structured `tracing` record.
pub struct TracingProgress;

impl SyncProgress for TracingProgress {
    fn on_table_start(&self, table: &str, index: usize, total: usize, window: &SyncWindow) {
        tracing::info!(table, position = index + 1, total, %window, "syncing table");
    }

    fn on_batch(&self, table: &str, batch: usize, batches: usize, error: Option<&str>) {
        match error {
            None => tracing::debug!(table, batch = batch + 1, batches, "batch fetched"),
            Some(error) => {
                tracing::warn!(table, batch = batch + 1, batches, error, "batch failed")
            }
        }
    }

    fn on_fetched(&self, table: &str, rows: &DataFrame) {
        tracing::info!(table, rows = rows.height(), columns = rows.width(), "new rows staged");
    }

    fn on_table_complete(&self, report: &TableReport) {
        tracing::info!(table = %report.table, outcome = %report.outcome, "table finished");
    }

    fn on_run_complete(&self, report: &SyncReport) {
        tracing::info!(
            tables = report.tables.len(),
            rows = report.total_rows(),
            failed = report.failed_count(),
            "sync complete"
        );
    }
}
