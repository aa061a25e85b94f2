//! Run configuration, loaded from an optional TOML file and overlaid by CLI flags.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tablesync_core::partition::DEFAULT_BATCH_SIZE;
use tablesync_core::vendor::datalink::{DEFAULT_BASE_URL, DEFAULT_DATASET};
use tablesync_core::vendor::{CircuitBreaker, DataLinkClient};
use tablesync_core::window::default_epoch_floor;
use tablesync_core::{open_store, DateRangeResolver, EndPolicy, StorageKind, TableStore, VendorError};
use thiserror::Error;

/// Environment variable consulted when no key is configured.
pub const API_KEY_ENV: &str = "NASDAQ_DATA_LINK_API_KEY";

/// Key file picked up from the working directory as a last resort.
pub const DEFAULT_KEY_FILE: &str = "key.txt";

/// Upper bound on `max_retries`; the backoff doubles per retry, so ten
/// retries already wait over eight minutes on one request.
pub const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no API key: pass --api-key, set api_key or api_key_file, export {API_KEY_ENV}, or create {DEFAULT_KEY_FILE}")]
    MissingApiKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub directory: PathBuf,
    /// CSV file prefix / database file stem.
    pub save_name: Option<String>,
    /// Where batches are staged; `{directory}/.staging` when unset.
    pub staging_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Csv,
            directory: PathBuf::from("data"),
            save_name: None,
            staging_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub dataset: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_file: Option<PathBuf>,
    pub storage: StorageConfig,
    /// Table ids to sync; empty means the whole catalog.
    pub tables: Vec<String>,
    /// Tickers per vendor request for large tables.
    pub partition_size: usize,
    pub end_policy: EndPolicy,
    pub epoch_floor: NaiveDate,
    pub first_run_lookback_days: u32,
    /// Rows of each fetched table echoed to the console.
    pub display_rows: usize,
    /// Retries per vendor request, at most [`MAX_RETRIES_LIMIT`].
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dataset: DEFAULT_DATASET.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            api_key_file: None,
            storage: StorageConfig::default(),
            tables: Vec::new(),
            partition_size: DEFAULT_BATCH_SIZE,
            end_policy: EndPolicy::Today,
            epoch_floor: default_epoch_floor(),
            first_run_lookback_days: 7,
            display_rows: 5,
            max_retries: 3,
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::Invalid("dataset must not be empty".into()));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".into()));
        }
        if self.partition_size == 0 {
            return Err(ConfigError::Invalid("partition_size must be at least 1".into()));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_retries {} is above the limit of {MAX_RETRIES_LIMIT}",
                self.max_retries
            )));
        }
        if let Some(name) = &self.storage.save_name {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "save_name '{name}' must be a plain file name"
                )));
            }
        }
        Ok(())
    }

    pub fn resolver(&self) -> DateRangeResolver {
        DateRangeResolver {
            end_policy: self.end_policy,
            epoch_floor: self.epoch_floor,
            first_run_lookback_days: self.first_run_lookback_days,
        }
    }

    pub fn partition_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.partition_size).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.storage
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.storage.directory.join(".staging"))
    }

    pub fn open_store(&self) -> Box<dyn TableStore> {
        open_store(
            self.storage.kind,
            &self.storage.directory,
            self.storage.save_name.as_deref(),
        )
    }

    /// API key from the environment of this process.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    /// API key lookup order: `api_key`, `api_key_file`, the environment,
    /// then `key.txt` in the working directory. Files contribute their
    /// first non-empty line.
    pub fn resolve_api_key_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<String, ConfigError> {
        if let Some(key) = self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        if let Some(path) = &self.api_key_file {
            return read_key_file(path)?.ok_or(ConfigError::MissingApiKey);
        }
        if let Some(key) = env(API_KEY_ENV).map(|k| k.trim().to_string()).filter(|k| !k.is_empty()) {
            return Ok(key);
        }
        let fallback = Path::new(DEFAULT_KEY_FILE);
        if fallback.is_file() {
            if let Some(key) = read_key_file(fallback)? {
                return Ok(key);
            }
        }
        Err(ConfigError::MissingApiKey)
    }

    /// HTTP client for the configured dataset.
    pub fn data_link_client(
        &self,
        api_key: String,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<DataLinkClient, VendorError> {
        Ok(DataLinkClient::new(api_key, self.dataset.clone(), circuit_breaker)?
            .with_base_url(self.base_url.clone())
            .with_retries(self.max_retries, Duration::from_millis(500)))
    }
}

fn read_key_file(path: &Path) -> Result<Option<String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = SyncConfig::from_toml("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.partition_size().get(), 1000);
        assert_eq!(config.display_rows, 5);
        assert_eq!(config.staging_dir(), PathBuf::from("data/.staging"));
    }

    #[test]
    fn partial_toml_overrides_only_given_keys() {
        let config = SyncConfig::from_toml(
            r#"
            tables = ["SEP", "EVENTS"]
            partition_size = 250
            end_policy = "yesterday"
            epoch_floor = "2010-01-01"

            [storage]
            kind = "sqlite"
            save_name = "mytest"
            "#,
        )
        .unwrap();

        assert_eq!(config.tables, vec!["SEP", "EVENTS"]);
        assert_eq!(config.partition_size().get(), 250);
        assert_eq!(config.end_policy, EndPolicy::Yesterday);
        assert_eq!(config.storage.kind, StorageKind::Sqlite);
        assert_eq!(config.storage.directory, PathBuf::from("data"));
        assert_eq!(config.dataset, "SHARADAR");

        let resolver = config.resolver();
        assert_eq!(resolver.epoch_floor, NaiveDate::from_ymd_opt(2010, 1, 1).unwrap());
        assert_eq!(resolver.first_run_lookback_days, 7);
    }

    #[test]
    fn zero_partition_size_is_rejected() {
        assert!(matches!(
            SyncConfig::from_toml("partition_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn retries_above_limit_are_rejected() {
        assert!(SyncConfig::from_toml("max_retries = 10").is_ok());
        assert!(matches!(
            SyncConfig::from_toml("max_retries = 40"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            SyncConfig::from_toml("tables = SEP"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn explicit_key_wins_over_env() {
        let config = SyncConfig {
            api_key: Some(" abc ".into()),
            ..SyncConfig::default()
        };
        let key = config
            .resolve_api_key_with(|_| Some("from-env".into()))
            .unwrap();
        assert_eq!(key, "abc");
    }

    #[test]
    fn key_file_first_line_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.txt");
        std::fs::write(&path, "\n  secret-key  \nignored\n").unwrap();

        let config = SyncConfig {
            api_key_file: Some(path),
            ..SyncConfig::default()
        };
        assert_eq!(config.resolve_api_key_with(|_| None).unwrap(), "secret-key");
    }

    #[test]
    fn env_key_used_when_nothing_configured() {
        let config = SyncConfig::default();
        let key = config
            .resolve_api_key_with(|name| (name == API_KEY_ENV).then(|| "env-key".to_string()))
            .unwrap();
        assert_eq!(key, "env-key");
    }
}
