//! Storage adapters: where synced tables live.
//!
//! Two backends implement [`TableStore`]:
//! - [`CsvStore`]: one CSV file per table, rewritten wholesale on each merge
//! - [`SqliteStore`]: one relational table per catalog table, append-only
//!
//! Both recompute the watermark from stored data on every call; nothing is
//! cached between runs, so out-of-band edits to the stored data are honoured.

pub mod csv_store;
pub mod sqlite_store;

pub use csv_store::CsvStore;
pub use sqlite_store::SqliteStore;

use crate::catalog::TableDescriptor;
use crate::frame::FrameError;
use chrono::NaiveDate;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stored state of a table's watermark column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Watermark {
    /// No file or relational table exists yet.
    TableAbsent,
    /// The table exists but holds no dated rows.
    Empty,
    /// Latest stored value of the watermark column.
    At(NaiveDate),
}

impl Watermark {
    /// The stored date, if any rows carry one.
    pub fn date(self) -> Option<NaiveDate> {
        match self {
            Watermark::At(d) => Some(d),
            Watermark::TableAbsent | Watermark::Empty => None,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::TableAbsent => f.write_str("(not stored)"),
            Watermark::Empty => f.write_str("(empty)"),
            Watermark::At(d) => write!(f, "{d}"),
        }
    }
}

/// Storage errors. Every variant means durable storage cannot be trusted for
/// the rest of the run.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is locked by another writer")]
    Locked { path: PathBuf },

    #[error("stored table {table} is unreadable: {reason}")]
    Corrupt { table: String, reason: String },

    #[error("rows for {table} do not fit the stored table: {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: FrameError,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    /// [`StorageError::Unavailable`] for an I/O failure at `path`.
    pub fn unavailable(path: &Path, source: std::io::Error) -> Self {
        StorageError::Unavailable {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the run must stop. Storage is a run-wide precondition, so
    /// every storage error is.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Which backend a run writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Csv,
    Sqlite,
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(StorageKind::Csv),
            "sqlite" | "db" => Ok(StorageKind::Sqlite),
            other => Err(format!("unknown storage kind '{other}' (expected csv or sqlite)")),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Csv => f.write_str("csv"),
            StorageKind::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Durable home for synced tables.
///
/// Implementations open a handle per call and release it before returning,
/// so external readers are never blocked between operations.
pub trait TableStore {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Latest stored value of the table's watermark column.
    fn read_watermark(&self, table: &TableDescriptor) -> Result<Watermark, StorageError>;

    /// Sorted distinct tickers stored for a table, or `None` if the table is absent.
    fn distinct_tickers(&self, table: &TableDescriptor) -> Result<Option<Vec<String>>, StorageError>;

    /// Merge `new_rows` into the stored table and persist. Returns rows written.
    fn merge_and_persist(
        &self,
        table: &TableDescriptor,
        new_rows: DataFrame,
    ) -> Result<usize, StorageError>;
}

/// Incoming rows must carry the watermark column, or the stored watermark
/// could never advance past them.
fn require_watermark_column(table: &TableDescriptor, rows: &DataFrame) -> Result<(), StorageError> {
    if rows.column(table.watermark.as_str()).is_err() {
        return Err(StorageError::SchemaMismatch {
            table: table.id.clone(),
            reason: format!("rows have no '{}' column", table.watermark),
        });
    }
    Ok(())
}

/// Open the configured backend rooted at `directory`.
///
/// CSV files are named `{save_name}_{ID}.csv` (or `{ID}.csv` without a name);
/// the database is `{directory}/{save_name}.db`.
pub fn open_store(
    kind: StorageKind,
    directory: &Path,
    save_name: Option<&str>,
) -> Box<dyn TableStore> {
    match kind {
        StorageKind::Csv => Box::new(CsvStore::new(directory, save_name.map(String::from))),
        StorageKind::Sqlite => Box::new(SqliteStore::new(database_path(directory, save_name))),
    }
}

/// `{directory}/{save_name}.db`, with `sharadar` as the default name.
pub fn database_path(directory: &Path, save_name: Option<&str>) -> PathBuf {
    directory.join(format!("{}.db", save_name.unwrap_or("sharadar")))
}
