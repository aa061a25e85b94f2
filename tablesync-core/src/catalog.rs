//! Table catalog: the fixed registry of vendor tables this tool can sync.
//!
//! A [`Catalog`] is built once at startup and passed by reference to every
//! component. Descriptors are validated at construction time, so a catalog
//! that exists is always well formed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Identifier of the reference table that holds the ticker universe.
pub const TICKERS_TABLE: &str = "TICKERS";

/// Name of the ticker column in ticker-keyed tables.
pub const TICKER_COLUMN: &str = "ticker";

/// The date column a table's watermark is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkColumn {
    Date,
    LastUpdated,
    FilingDate,
    CalendarDate,
}

impl WatermarkColumn {
    /// Column name as it appears in the vendor schema.
    pub fn as_str(self) -> &'static str {
        match self {
            WatermarkColumn::Date => "date",
            WatermarkColumn::LastUpdated => "lastupdated",
            WatermarkColumn::FilingDate => "filingdate",
            WatermarkColumn::CalendarDate => "calendardate",
        }
    }
}

impl fmt::Display for WatermarkColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog metadata for one vendor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Upper-case vendor table code, e.g. `SEP`.
    pub id: String,
    /// Column whose maximum marks how far the stored table reaches.
    pub watermark: WatermarkColumn,
    /// Vendor's description of the table.
    pub label: String,
    /// Relative size. Anything above 1 is fetched in ticker batches.
    pub chunk_weight: u32,
    /// Whether rows carry a `ticker` column (secondary sort key, partition filter).
    pub ticker_keyed: bool,
}

impl TableDescriptor {
    /// Ticker-keyed descriptor; use [`TableDescriptor::without_ticker`] otherwise.
    pub fn new(
        id: impl Into<String>,
        watermark: WatermarkColumn,
        label: impl Into<String>,
        chunk_weight: u32,
    ) -> Self {
        Self {
            id: id.into(),
            watermark,
            label: label.into(),
            chunk_weight,
            ticker_keyed: true,
        }
    }

    /// Mark the table as having no ticker column.
    pub fn without_ticker(mut self) -> Self {
        self.ticker_keyed = false;
        self
    }

    /// Large tables are partitioned by ticker and get a bounded first fetch.
    pub fn is_large(&self) -> bool {
        self.chunk_weight > 1
    }

    /// Whether fetches for this table are split into ticker batches.
    pub fn is_partitioned(&self) -> bool {
        self.is_large() && self.ticker_keyed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// Immutable registry of table descriptors keyed by upper-case identifier.
#[derive(Debug, Clone)]
pub struct Catalog {
    tables: BTreeMap<String, TableDescriptor>,
}

impl Catalog {
    /// Build a catalog, rejecting empty or duplicate ids and zero chunk weights.
    pub fn new(descriptors: impl IntoIterator<Item = TableDescriptor>) -> Result<Self, CatalogError> {
        let mut tables = BTreeMap::new();
        for mut desc in descriptors {
            let id = desc.id.trim().to_ascii_uppercase();
            if id.is_empty() {
                return Err(CatalogError::Invalid("empty table id".into()));
            }
            if desc.chunk_weight == 0 {
                return Err(CatalogError::Invalid(format!(
                    "table '{id}' has chunk weight 0 (must be >= 1)"
                )));
            }
            desc.id = id.clone();
            if tables.insert(id.clone(), desc).is_some() {
                return Err(CatalogError::Invalid(format!("duplicate table id '{id}'")));
            }
        }
        if tables.is_empty() {
            return Err(CatalogError::Invalid("catalog has no tables".into()));
        }
        Ok(Self { tables })
    }

    /// The Sharadar table set served by Nasdaq Data Link.
    pub fn sharadar() -> Self {
        use WatermarkColumn::*;
        let descriptors = vec![
            TableDescriptor::new("SF1", LastUpdated, "Core US Fundamentals", 4),
            TableDescriptor::new("DAILY", LastUpdated, "Daily Metrics", 8),
            TableDescriptor::new("SEP", Date, "Sharadar Equity Prices", 8),
            TableDescriptor::new(TICKERS_TABLE, LastUpdated, "Tickers and Metadata", 1),
            TableDescriptor::new("ACTIONS", Date, "Corporate Actions", 1),
            TableDescriptor::new("EVENTS", Date, "Core US Fundamental Events", 1),
            TableDescriptor::new("SF2", FilingDate, "Core US Insiders", 2),
            TableDescriptor::new(
                "SF3A",
                CalendarDate,
                "Core US Institutional Investors Summary by Ticker",
                1,
            ),
            TableDescriptor::new(
                "SF3B",
                CalendarDate,
                "Core US Institutional Investors Summary by Investor",
                1,
            )
            .without_ticker(),
            TableDescriptor::new("SFP", Date, "Sharadar Fund Prices", 4),
            TableDescriptor::new("SP500", Date, "S&P500 Current and Historical Constituents", 1),
        ];
        // The built-in table list is static and known valid.
        Self::new(descriptors).unwrap_or_else(|e| unreachable!("built-in catalog: {e}"))
    }

    /// Look up a table by id (case-insensitive).
    pub fn lookup(&self, id: &str) -> Result<&TableDescriptor, CatalogError> {
        self.tables
            .get(&id.trim().to_ascii_uppercase())
            .ok_or_else(|| CatalogError::UnknownTable(id.to_string()))
    }

    /// All registered identifiers.
    pub fn all_ids(&self) -> BTreeSet<&str> {
        self.tables.keys().map(|k| k.as_str()).collect()
    }

    /// Descriptors in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    /// Number of registered tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Always false for a catalog built through [`Catalog::new`].
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::sharadar()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharadar_catalog_has_all_tables() {
        let catalog = Catalog::sharadar();
        for id in [
            "SF1", "SF2", "EVENTS", "SF3A", "SF3B", "SEP", "TICKERS", "DAILY", "SP500",
            "ACTIONS", "SFP",
        ] {
            assert!(catalog.all_ids().contains(id), "missing {id}");
        }
        assert_eq!(catalog.len(), 11);
    }

    #[test]
    fn watermark_columns_match_vendor_schema() {
        let catalog = Catalog::sharadar();
        for id in ["ACTIONS", "SEP", "EVENTS", "SFP", "SP500"] {
            assert_eq!(catalog.lookup(id).unwrap().watermark.as_str(), "date");
        }
        for id in ["SF1", "DAILY", "TICKERS"] {
            assert_eq!(catalog.lookup(id).unwrap().watermark.as_str(), "lastupdated");
        }
        for id in ["SF3A", "SF3B"] {
            assert_eq!(catalog.lookup(id).unwrap().watermark.as_str(), "calendardate");
        }
        assert_eq!(catalog.lookup("SF2").unwrap().watermark.as_str(), "filingdate");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let catalog = Catalog::sharadar();
        assert_eq!(catalog.lookup("sep").unwrap().id, "SEP");
    }

    #[test]
    fn unknown_table_is_an_error() {
        let catalog = Catalog::sharadar();
        assert_eq!(
            catalog.lookup("SF9"),
            Err(CatalogError::UnknownTable("SF9".into()))
        );
    }

    #[test]
    fn only_sf3b_lacks_a_ticker_column() {
        let catalog = Catalog::sharadar();
        let untickered: Vec<_> = catalog
            .iter()
            .filter(|d| !d.ticker_keyed)
            .map(|d| d.id.as_str())
            .collect();
        assert_eq!(untickered, vec!["SF3B"]);
    }

    #[test]
    fn rejects_zero_chunk_weight() {
        let err = Catalog::new([TableDescriptor::new("X", WatermarkColumn::Date, "x", 0)]);
        assert!(matches!(err, Err(CatalogError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = Catalog::new([
            TableDescriptor::new("x", WatermarkColumn::Date, "x", 1),
            TableDescriptor::new("X", WatermarkColumn::Date, "x again", 1),
        ]);
        assert!(matches!(err, Err(CatalogError::Invalid(_))));
    }
}
