//! Sync orchestrator: drives every requested table through
//! watermark → window → fetch → stage → consolidate.
//!
//! Vendor failures are scoped to one batch and never abort the run. Storage
//! failures always do: once durable storage cannot be trusted there is no
//! point fetching more.

use crate::progress::{NoProgress, SyncProgress};
use crate::report::{SyncReport, TableOutcome, TableReport};
use crate::staging::StagingArea;
use crate::universe::{load_ticker_universe, UniverseError};
use chrono::{Local, NaiveDate, Utc};
use polars::prelude::DataFrame;
use std::num::NonZeroUsize;
use tablesync_core::catalog::{TICKERS_TABLE, TICKER_COLUMN};
use tablesync_core::frame::distinct_strings;
use tablesync_core::partition::DEFAULT_BATCH_SIZE;
use tablesync_core::{
    Catalog, DateOverrides, DateRangeResolver, FetchFilter, StorageError, StorageKind,
    SyncWindow, TableDescriptor, TableStore, TickerPartitioner, Vendor, WindowError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync aborted: {0}")]
    Storage(#[from] StorageError),
}

/// Batch bookkeeping for one table.
#[derive(Debug, Default)]
struct FetchTally {
    total: usize,
    failed: usize,
    last_error: Option<String>,
}

impl FetchTally {
    fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}

pub struct Synchronizer<'a> {
    catalog: &'a Catalog,
    store: &'a dyn TableStore,
    vendor: &'a dyn Vendor,
    staging: StagingArea,
    resolver: DateRangeResolver,
    partition_size: NonZeroUsize,
    storage_kind: StorageKind,
    progress: &'a dyn SyncProgress,
}

impl<'a> Synchronizer<'a> {
    pub fn new(
        catalog: &'a Catalog,
        store: &'a dyn TableStore,
        vendor: &'a dyn Vendor,
        staging: StagingArea,
    ) -> Self {
        Self {
            catalog,
            store,
            vendor,
            staging,
            resolver: DateRangeResolver::default(),
            partition_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            storage_kind: StorageKind::default(),
            progress: &NoProgress,
        }
    }

    pub fn with_resolver(mut self, resolver: DateRangeResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_partition_size(mut self, size: NonZeroUsize) -> Self {
        self.partition_size = size;
        self
    }

    /// Backend recorded in the run report.
    pub fn with_storage_kind(mut self, kind: StorageKind) -> Self {
        self.storage_kind = kind;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn SyncProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Sync `ids` up to today's local date.
    pub fn run(&self, ids: &[String], overrides: &DateOverrides) -> Result<SyncReport, SyncError> {
        self.run_on(ids, overrides, Local::now().date_naive())
    }

    /// Sync `ids` as if today were `today`.
    ///
    /// Every table gets an entry in the report, in processing order. Returns
    /// `Err` only when storage fails; tables processed before the failure
    /// keep what they wrote.
    pub fn run_on(
        &self,
        ids: &[String],
        overrides: &DateOverrides,
        today: NaiveDate,
    ) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let ids = expand_table_ids(self.catalog, ids);
        let total = ids.len();
        let mut universe: Option<TickerPartitioner> = None;
        let mut tables = Vec::with_capacity(total);

        tracing::info!(
            tables = total,
            store = %self.store.describe(),
            vendor = self.vendor.name(),
            "starting sync"
        );

        for (index, id) in ids.iter().enumerate() {
            let report = match self.catalog.lookup(id) {
                Ok(table) => TableReport {
                    table: table.id.clone(),
                    label: table.label.clone(),
                    outcome: self.sync_table(table, overrides, today, index, total, &mut universe)?,
                },
                Err(e) => {
                    tracing::warn!(table = %id, "{e}");
                    TableReport {
                        table: id.clone(),
                        label: String::new(),
                        outcome: TableOutcome::Failed {
                            reason: e.to_string(),
                        },
                    }
                }
            };
            self.progress.on_table_complete(&report);
            tables.push(report);
        }

        let report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            storage: self.storage_kind,
            tables,
        };
        self.progress.on_run_complete(&report);
        Ok(report)
    }

    fn sync_table(
        &self,
        table: &TableDescriptor,
        overrides: &DateOverrides,
        today: NaiveDate,
        index: usize,
        total: usize,
        universe: &mut Option<TickerPartitioner>,
    ) -> Result<TableOutcome, SyncError> {
        let watermark = self.store.read_watermark(table)?;
        tracing::debug!(table = %table.id, %watermark, column = %table.watermark, "read watermark");

        let window = match self
            .resolver
            .resolve(table, overrides, watermark.date(), today)
        {
            Ok(window) => window,
            Err(e @ WindowError::UpToDate { .. }) => {
                tracing::info!(table = %table.id, "{e}");
                return Ok(TableOutcome::Skipped {
                    reason: e.to_string(),
                });
            }
            Err(e @ WindowError::InvalidRange { .. }) => {
                tracing::warn!(table = %table.id, "{e}");
                return Ok(TableOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        };

        self.progress.on_table_start(&table.id, index, total, &window);

        let discarded = self.staging.begin(&table.id)?;
        if discarded > 0 {
            tracing::warn!(table = %table.id, batches = discarded, "discarded batches staged by an interrupted run");
        }

        let base = FetchFilter::for_window(table, window);
        let tally = if table.is_partitioned() {
            let partitioner = self.partitioner(universe)?;
            if partitioner.ticker_count() == 0 {
                tracing::warn!(table = %table.id, "ticker universe is empty, fetching without partitioning");
                self.fetch_whole(table, &base)?
            } else {
                self.fetch_batches(table, &base, partitioner)?
            }
        } else {
            self.fetch_whole(table, &base)?
        };

        if tally.all_failed() {
            self.staging.clear(&table.id)?;
            let reason = match (tally.total, tally.last_error) {
                (1, Some(e)) => e,
                (n, Some(e)) => format!("all {n} batches failed (last: {e})"),
                (n, None) => format!("all {n} batches failed"),
            };
            return Ok(TableOutcome::Failed { reason });
        }

        let staged = self.staging.drain(&table.id)?;
        if staged.height() == 0 {
            tracing::info!(table = %table.id, %window, "no new data");
            self.staging.clear(&table.id)?;
            return Ok(self.completed(window, 0, None, &tally));
        }

        self.progress.on_fetched(&table.id, &staged);
        let tickers = ticker_range(table, &staged);
        let rows_written = self.store.merge_and_persist(table, staged)?;
        self.staging.clear(&table.id)?;

        tracing::info!(
            table = %table.id,
            rows = rows_written,
            %window,
            failed_batches = tally.failed,
            "table synced"
        );
        Ok(self.completed(window, rows_written, tickers, &tally))
    }

    fn completed(
        &self,
        window: SyncWindow,
        rows_written: usize,
        tickers: Option<(String, String)>,
        tally: &FetchTally,
    ) -> TableOutcome {
        let (first_ticker, last_ticker) = match tickers {
            Some((first, last)) => (Some(first), Some(last)),
            None => (None, None),
        };
        TableOutcome::Completed {
            rows_written,
            window,
            first_ticker,
            last_ticker,
            batches_total: tally.total,
            batches_failed: tally.failed,
        }
    }

    /// Ticker universe, loaded at most once per run. A vendor failure while
    /// loading leaves an empty universe; a storage failure aborts.
    fn partitioner<'u>(
        &self,
        universe: &'u mut Option<TickerPartitioner>,
    ) -> Result<&'u TickerPartitioner, SyncError> {
        if universe.is_none() {
            let tickers = match load_ticker_universe(self.catalog, self.store, self.vendor) {
                Ok(tickers) => tickers,
                Err(UniverseError::Storage(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!("{e}");
                    Vec::new()
                }
            };
            *universe = Some(TickerPartitioner::new(tickers, self.partition_size));
        }
        Ok(universe.get_or_insert_with(|| TickerPartitioner::new(Vec::new(), self.partition_size)))
    }

    fn fetch_whole(&self, table: &TableDescriptor, filter: &FetchFilter) -> Result<FetchTally, SyncError> {
        let mut tally = FetchTally {
            total: 1,
            ..FetchTally::default()
        };
        self.fetch_batch(table, filter, 0, 1, &mut tally)?;
        Ok(tally)
    }

    fn fetch_batches(
        &self,
        table: &TableDescriptor,
        base: &FetchFilter,
        partitioner: &TickerPartitioner,
    ) -> Result<FetchTally, SyncError> {
        let batches = partitioner.batch_count();
        let mut tally = FetchTally {
            total: batches,
            ..FetchTally::default()
        };

        for (batch_no, tickers) in partitioner.batches().enumerate() {
            if !self.vendor.is_available() {
                let remaining = batches - batch_no;
                tracing::warn!(
                    table = %table.id,
                    remaining,
                    "vendor is refusing requests, skipping remaining batches"
                );
                for b in batch_no..batches {
                    self.progress
                        .on_batch(&table.id, b, batches, Some("vendor unavailable"));
                }
                tally.failed += remaining;
                tally.last_error = Some("vendor unavailable".into());
                break;
            }

            let filter = base.clone().with_tickers(tickers);
            self.fetch_batch(table, &filter, batch_no, batches, &mut tally)?;
        }
        Ok(tally)
    }

    /// Fetch one batch and stage it. Vendor errors are tallied; staging
    /// errors propagate.
    fn fetch_batch(
        &self,
        table: &TableDescriptor,
        filter: &FetchFilter,
        batch_no: usize,
        batches: usize,
        tally: &mut FetchTally,
    ) -> Result<(), SyncError> {
        match self.vendor.fetch(table, filter) {
            Ok(frame) => {
                if frame.height() > 0 {
                    self.staging.stage(&table.id, batch_no, &frame)?;
                }
                self.progress.on_batch(&table.id, batch_no, batches, None);
            }
            Err(e) => {
                let message = e.to_string();
                self.progress
                    .on_batch(&table.id, batch_no, batches, Some(&message));
                tally.failed += 1;
                tally.last_error = Some(message);
            }
        }
        Ok(())
    }
}

/// First and last ticker present in the fetched rows.
fn ticker_range(table: &TableDescriptor, rows: &DataFrame) -> Option<(String, String)> {
    if !table.ticker_keyed {
        return None;
    }
    let tickers = distinct_strings(rows, TICKER_COLUMN).ok()?;
    Some((tickers.first()?.clone(), tickers.last()?.clone()))
}

/// Normalise requested ids: upper-cased, de-duplicated, `TICKERS` first so
/// later tables can partition on a fresh universe. An empty request or
/// `ALL` means the whole catalog. Unknown ids are kept so they get reported.
pub fn expand_table_ids(catalog: &Catalog, ids: &[String]) -> Vec<String> {
    let requested: Vec<String> = ids
        .iter()
        .map(|id| id.trim().to_ascii_uppercase())
        .filter(|id| !id.is_empty())
        .collect();

    let mut out: Vec<String> = if requested.is_empty() || requested.iter().any(|id| id == "ALL") {
        catalog.all_ids().into_iter().map(String::from).collect()
    } else {
        let mut seen = std::collections::HashSet::new();
        requested
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect()
    };

    if let Some(pos) = out.iter().position(|id| id == TICKERS_TABLE) {
        let tickers = out.remove(pos);
        out.insert(0, tickers);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_core::{frame_from_rows, ColumnSpec};

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_request_means_whole_catalog_tickers_first() {
        let catalog = Catalog::sharadar();
        let expanded = expand_table_ids(&catalog, &[]);
        assert_eq!(expanded.len(), catalog.len());
        assert_eq!(expanded[0], "TICKERS");
    }

    #[test]
    fn all_keyword_is_case_insensitive() {
        let catalog = Catalog::sharadar();
        assert_eq!(expand_table_ids(&catalog, &ids(&["all"])).len(), catalog.len());
    }

    #[test]
    fn explicit_ids_are_normalised_and_deduplicated() {
        let catalog = Catalog::sharadar();
        let expanded = expand_table_ids(&catalog, &ids(&["sep", "EVENTS", "SEP", "tickers", "NOPE"]));
        assert_eq!(expanded, ids(&["TICKERS", "SEP", "EVENTS", "NOPE"]));
    }

    #[test]
    fn ticker_range_ignores_tables_without_tickers() {
        let catalog = Catalog::sharadar();
        let rows = frame_from_rows(
            &[ColumnSpec::text("ticker"), ColumnSpec::text("calendardate")],
            &[vec!["MSFT", "2020-03-31"], vec!["AAPL", "2020-03-31"]],
        )
        .unwrap();

        let sf3a = catalog.lookup("SF3A").unwrap();
        let sf3b = catalog.lookup("SF3B").unwrap();
        assert_eq!(
            ticker_range(sf3a, &rows),
            Some(("AAPL".to_string(), "MSFT".to_string()))
        );
        assert_eq!(ticker_range(sf3b, &rows), None);
    }

    #[test]
    fn tally_all_failed_needs_at_least_one_batch() {
        assert!(!FetchTally::default().all_failed());
        let tally = FetchTally {
            total: 3,
            failed: 3,
            last_error: None,
        };
        assert!(tally.all_failed());
    }
}
