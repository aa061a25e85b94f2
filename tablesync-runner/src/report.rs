//! Per-table outcomes and the run report (JSON export).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tablesync_core::{StorageKind, SyncWindow};

/// Final state of one table in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    /// Rows were fetched (possibly none) and the store is consistent.
    Completed {
        rows_written: usize,
        window: SyncWindow,
        first_ticker: Option<String>,
        last_ticker: Option<String>,
        batches_total: usize,
        batches_failed: usize,
    },
    /// Nothing to fetch.
    Skipped { reason: String },
    /// No rows were written for this table.
    Failed { reason: String },
}

impl TableOutcome {
    pub fn rows_written(&self) -> usize {
        match self {
            TableOutcome::Completed { rows_written, .. } => *rows_written,
            TableOutcome::Skipped { .. } | TableOutcome::Failed { .. } => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TableOutcome::Failed { .. })
    }
}

impl fmt::Display for TableOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableOutcome::Completed {
                rows_written,
                window,
                first_ticker,
                last_ticker,
                batches_total,
                batches_failed,
            } => {
                write!(f, "completed: {rows_written} rows for {window}")?;
                if let (Some(first), Some(last)) = (first_ticker, last_ticker) {
                    write!(f, ", tickers {first}..{last}")?;
                }
                if *batches_failed > 0 {
                    write!(f, " ({batches_failed}/{batches_total} batches failed)")?;
                }
                Ok(())
            }
            TableOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            TableOutcome::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub label: String,
    #[serde(flatten)]
    pub outcome: TableOutcome,
}

/// Everything a run did, in processing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub storage: StorageKind,
    pub tables: Vec<TableReport>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        self.tables.iter().any(|t| t.outcome.is_failed())
    }

    pub fn failed_count(&self) -> usize {
        self.tables.iter().filter(|t| t.outcome.is_failed()).count()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.outcome.rows_written()).sum()
    }

    pub fn table(&self, id: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == id)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize sync report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write sync report to {}", path.display()))?;
        Ok(())
    }
}
