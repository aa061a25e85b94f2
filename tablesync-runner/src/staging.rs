//! Staging area for fetched batches.
//!
//! Layout: `{root}/{TABLE}/batch-{n:05}.csv` plus a `batch-{n:05}.schema.json`
//! sidecar holding the vendor column kinds, which plain CSV cannot carry.
//!
//! Batches land here first so the stored table is only touched once per run,
//! in the consolidate step.

use polars::functions::concat_df_diagonal;
use polars::prelude::DataFrame;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tablesync_core::frame::{self, column_specs, schema_for};
use tablesync_core::{ColumnSpec, StorageError};

/// On-disk staging of fetched batches, one directory per table.
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding every table's staged batches.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table_id: &str) -> PathBuf {
        self.root.join(table_id)
    }

    fn batch_path(&self, table_id: &str, batch_no: usize) -> PathBuf {
        self.table_dir(table_id).join(format!("batch-{batch_no:05}.csv"))
    }

    fn schema_path(batch_path: &Path) -> PathBuf {
        batch_path.with_extension("schema.json")
    }

    /// Start staging a table. Leftovers from an interrupted run are discarded;
    /// their rows were never consolidated, so the watermark still covers them.
    /// Returns the number of discarded batches.
    pub fn begin(&self, table_id: &str) -> Result<usize, StorageError> {
        let stale = self.staged_batches(table_id)?.len();
        self.clear(table_id)?;
        Ok(stale)
    }

    /// Write one batch. The file is written to `.tmp` and renamed, so a
    /// staged batch is either complete or absent.
    pub fn stage(
        &self,
        table_id: &str,
        batch_no: usize,
        batch: &DataFrame,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.table_dir(table_id);
        fs::create_dir_all(&dir).map_err(|e| StorageError::unavailable(&dir, e))?;

        let path = self.batch_path(table_id, batch_no);
        let schema = serde_json::to_vec(&column_specs(batch)).map_err(|e| StorageError::Corrupt {
            table: table_id.to_string(),
            reason: format!("schema serialization: {e}"),
        })?;
        let schema_path = Self::schema_path(&path);
        fs::write(&schema_path, schema).map_err(|e| StorageError::unavailable(&schema_path, e))?;

        let tmp_path = path.with_extension("csv.tmp");
        let file = File::create(&tmp_path).map_err(|e| StorageError::unavailable(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        frame::write_csv(&mut batch.clone(), &mut writer).map_err(|source| StorageError::Csv {
            path: tmp_path.clone(),
            source,
        })?;
        writer
            .flush()
            .map_err(|e| StorageError::unavailable(&tmp_path, e))?;
        drop(writer);

        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StorageError::unavailable(&path, e)
        })?;
        Ok(path)
    }

    /// Staged batch files for a table, in batch order.
    pub fn staged_batches(&self, table_id: &str) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.table_dir(table_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::unavailable(&dir, e)),
        };

        let mut batches = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StorageError::unavailable(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("csv") {
                batches.push(path);
            }
        }
        batches.sort();
        Ok(batches)
    }

    /// Column list written next to a batch, or `None` for a batch staged
    /// without one.
    fn read_schema(&self, table_id: &str, batch_path: &Path) -> Result<Option<Vec<ColumnSpec>>, StorageError> {
        let schema_path = Self::schema_path(batch_path);
        let raw = match fs::read(&schema_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::unavailable(&schema_path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                table: table_id.to_string(),
                reason: format!("{}: {e}", schema_path.display()),
            })
    }

    /// Read every staged batch into one frame, in batch order. Staged files
    /// stay in place until [`StagingArea::clear`].
    pub fn drain(&self, table_id: &str) -> Result<DataFrame, StorageError> {
        let mut batches = Vec::new();
        for path in self.staged_batches(table_id)? {
            let schema = self.read_schema(table_id, &path)?.map(|columns| schema_for(&columns));
            let batch = frame::read_csv(&path, schema).map_err(|source| StorageError::Csv {
                path: path.clone(),
                source,
            })?;
            batches.push(batch);
        }

        match batches.len() {
            0 => Ok(DataFrame::empty()),
            1 => Ok(batches.remove(0)),
            _ => concat_df_diagonal(&batches).map_err(|e| StorageError::Corrupt {
                table: table_id.to_string(),
                reason: format!("staged batches do not line up: {e}"),
            }),
        }
    }

    /// Remove everything staged for a table.
    pub fn clear(&self, table_id: &str) -> Result<(), StorageError> {
        let dir = self.table_dir(table_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::unavailable(&dir, e)),
        }
    }
}
