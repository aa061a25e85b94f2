//! tablesync runner: drives incremental syncs on top of `tablesync-core`.
//!
//! - Per-table sync state machine with per-batch failure isolation
//! - On-disk staging of fetched batches before one consolidating write
//! - Ticker universe loading for partitioned tables
//! - Run configuration (TOML) and the JSON run report
//! - Progress hooks

pub mod config;
pub mod progress;
pub mod report;
pub mod staging;
pub mod sync;
pub mod universe;

pub use config::{ConfigError, StorageConfig, SyncConfig};
pub use progress::{NoProgress, SyncProgress, TracingProgress};
pub use report::{SyncReport, TableOutcome, TableReport};
pub use staging::StagingArea;
pub use sync::{expand_table_ids, SyncError, Synchronizer};
pub use universe::{load_ticker_universe, UniverseError};
