//! Ticker partitioning for large tables.
//!
//! A [`TickerPartitioner`] owns the ticker universe once and hands out
//! bounded batches as borrowed slices. Iteration is lazy and can be started
//! again for a retry without re-querying the universe.

use std::num::NonZeroUsize;

/// Default number of tickers per vendor request.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Splits a ticker universe into request-sized batches.
#[derive(Debug, Clone)]
pub struct TickerPartitioner {
    tickers: Vec<String>,
    batch_size: NonZeroUsize,
}

impl TickerPartitioner {
    /// Partition `tickers` as given; callers normalize the universe first.
    pub fn new(tickers: Vec<String>, batch_size: NonZeroUsize) -> Self {
        Self {
            tickers,
            batch_size,
        }
    }

    /// Partitioner with [`DEFAULT_BATCH_SIZE`].
    pub fn with_default_size(tickers: Vec<String>) -> Self {
        Self::new(
            tickers,
            NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
        )
    }

    /// Maximum tickers per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    /// Size of the universe.
    pub fn ticker_count(&self) -> usize {
        self.tickers.len()
    }

    /// Number of batches [`TickerPartitioner::batches`] yields.
    pub fn batch_count(&self) -> usize {
        self.tickers.len().div_ceil(self.batch_size.get())
    }

    /// The whole universe, in batch order.
    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    /// Batches of at most `batch_size` tickers, in input order.
    pub fn batches(&self) -> std::slice::Chunks<'_, String> {
        self.tickers.chunks(self.batch_size.get())
    }
}

/// Sorted, de-duplicated, non-empty ticker symbols.
pub fn normalize_universe(tickers: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = tickers
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
