//! Ticker universe used to partition large tables.

use tablesync_core::catalog::{TICKERS_TABLE, TICKER_COLUMN};
use tablesync_core::frame::distinct_strings;
use tablesync_core::partition::normalize_universe;
use tablesync_core::{Catalog, CatalogError, FetchFilter, StorageError, TableStore, Vendor, VendorError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("could not fetch ticker universe: {0}")]
    Vendor(#[from] VendorError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Every known ticker, sorted and de-duplicated.
///
/// Prefers the stored `TICKERS` table. When it has never been synced the
/// vendor's `TICKERS` table is fetched once, unfiltered.
pub fn load_ticker_universe(
    catalog: &Catalog,
    store: &dyn TableStore,
    vendor: &dyn Vendor,
) -> Result<Vec<String>, UniverseError> {
    let tickers_table = catalog.lookup(TICKERS_TABLE)?;

    if let Some(stored) = store.distinct_tickers(tickers_table)? {
        if !stored.is_empty() {
            tracing::debug!(tickers = stored.len(), "ticker universe from stored table");
            return Ok(normalize_universe(stored));
        }
    }

    let filter = FetchFilter {
        column: tickers_table.watermark,
        window: None,
        tickers: None,
    };
    let fetched = vendor.fetch(tickers_table, &filter)?;
    let tickers = distinct_strings(&fetched, TICKER_COLUMN).map_err(|e| {
        VendorError::ResponseFormatChanged(format!("{TICKERS_TABLE}: {e}"))
    })?;
    tracing::info!(tickers = tickers.len(), vendor = vendor.name(), "ticker universe fetched");
    Ok(normalize_universe(tickers))
}
