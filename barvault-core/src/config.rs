//! Archive configuration.
//!
//! Stored as an optional TOML file. Every field has a default, so an empty
//! file (or no file) yields a working configuration rooted at `./data`.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::executor::RetryPolicy;
use crate::symbol::{ProtectedIndexes, Symbol, DEFAULT_SYMBOL_WIDTH};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub start_date: NaiveDate,
    /// Today when unset.
    pub end_date: Option<NaiveDate>,
    pub batch_size: usize,
    /// Computed from the universe size when unset.
    pub total_batches: Option<usize>,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub request_delay_ms: u64,
    pub batch_wait_secs: u64,
    pub min_history_days: usize,
    /// 0 means no limit.
    pub max_symbols: usize,
    pub symbol_width: usize,
    pub refresh_constituents: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default(),
            end_date: None,
            batch_size: 160,
            total_batches: None,
            max_retries: 5,
            base_delay_ms: 1000,
            request_delay_ms: 1000,
            batch_wait_secs: 300,
            min_history_days: 0,
            max_symbols: 0,
            symbol_width: DEFAULT_SYMBOL_WIDTH,
            refresh_constituents: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub reference_symbol: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            reference_symbol: "000001".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub code: String,
    #[serde(default)]
    pub name: String,
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub paths: PathsConfig,
    pub download: DownloadConfig,
    pub calendar: CalendarConfig,
    /// Tracked indexes. The style defaults when empty.
    pub indexes: Vec<IndexEntry>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            download: DownloadConfig::default(),
            calendar: CalendarConfig::default(),
            indexes: Vec::new(),
        }
    }
}

impl ArchiveConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.download;
        if d.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if d.total_batches == Some(0) {
            return Err(ConfigError::Invalid("total_batches must be positive".into()));
        }
        if d.symbol_width == 0 {
            return Err(ConfigError::Invalid("symbol_width must be positive".into()));
        }
        if let Some(end) = d.end_date {
            if end < d.start_date {
                return Err(ConfigError::Invalid(format!(
                    "end_date {end} is before start_date {}",
                    d.start_date
                )));
            }
        }
        Ok(())
    }

    pub fn end_date(&self) -> NaiveDate {
        self.download
            .end_date
            .unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn protected_indexes(&self) -> ProtectedIndexes {
        if self.indexes.is_empty() {
            ProtectedIndexes::style_defaults()
        } else {
            ProtectedIndexes::new(self.indexes.iter().map(|e| (e.code.as_str(), e.name.clone())))
        }
    }

    pub fn reference_symbol(&self) -> Symbol {
        Symbol::stock(&self.calendar.reference_symbol)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.download.max_retries,
            base_delay: Duration::from_millis(self.download.base_delay_ms),
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.download.request_delay_ms)
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_secs(self.download.batch_wait_secs)
    }

    pub fn layout(&self) -> ArchiveLayout {
        ArchiveLayout::new(&self.paths.data_dir)
    }
}

/// Every file location under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub data_dir: PathBuf,
}

impl ArchiveLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn price_cache_dir(&self) -> PathBuf {
        self.data_dir.join("price_cache")
    }

    pub fn constituents_dir(&self) -> PathBuf {
        self.data_dir.join("constituents_cache")
    }

    pub fn canonical_path(&self) -> PathBuf {
        self.data_dir.join("prices.csv")
    }

    pub fn universe_path(&self) -> PathBuf {
        self.data_dir.join("constituents.csv")
    }

    pub fn batch_state_path(&self) -> PathBuf {
        self.data_dir.join("batch_state.json")
    }

    pub fn failed_indexes_path(&self) -> PathBuf {
        self.data_dir.join("failed_indexes.txt")
    }

    pub fn failed_stocks_path(&self) -> PathBuf {
        self.data_dir.join("failed_stocks.txt")
    }

    pub fn pending_path(&self) -> PathBuf {
        self.data_dir.join("pending_stocks.txt")
    }

    pub fn download_log_path(&self) -> PathBuf {
        self.data_dir.join("download_log.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
