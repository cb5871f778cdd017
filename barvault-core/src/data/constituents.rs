//! Index constituent snapshots and their on-disk cache.
//!
//! Layout: `{constituents_dir}/constituents_{index}.csv` with `date,symbol`
//! rows. The latest date in a file is the snapshot; a snapshot stays
//! authoritative until a fresh run asks for a refresh.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::normalize::parse_date;
use super::pacing::{backoff_delay, Pacer};
use super::provider::DataError;
use super::table::write_atomic;
use crate::symbol::{normalize_code, Symbol};

const DATE_HEADERS: &[&str] = &["date", "日期"];
const CODE_HEADERS: &[&str] = &["symbol", "code", "成分股代码", "品种代码"];

/// Members of one index as of a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstituentSnapshot {
    pub index: String,
    pub as_of: Option<NaiveDate>,
    pub members: Vec<String>,
}

/// Remote (or manifest) source of constituent lists.
pub trait ConstituentSource {
    fn get_constituents(&self, index: &Symbol) -> Result<ConstituentSnapshot, DataError>;
}

/// Disk cache in front of an optional [`ConstituentSource`].
///
/// One instance serves one run and is handed to whichever component needs
/// snapshots.
pub struct ConstituentCache<'a> {
    dir: PathBuf,
    source: Option<&'a dyn ConstituentSource>,
    pacer: &'a dyn Pacer,
    max_retries: u32,
    base_delay: std::time::Duration,
    width: usize,
}

impl<'a> ConstituentCache<'a> {
    pub fn new(dir: impl Into<PathBuf>, pacer: &'a dyn Pacer) -> Self {
        Self {
            dir: dir.into(),
            source: None,
            pacer,
            max_retries: 5,
            base_delay: std::time::Duration::from_secs(1),
            width: crate::symbol::DEFAULT_SYMBOL_WIDTH,
        }
    }

    pub fn with_source(mut self, source: &'a dyn ConstituentSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: std::time::Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, index: &str) -> PathBuf {
        self.dir.join(format!("constituents_{index}.csv"))
    }

    /// Snapshot stored on disk, if any. Malformed files are logged and ignored.
    pub fn cached(&self, index: &Symbol) -> Option<ConstituentSnapshot> {
        let path = self.snapshot_path(index.code());
        if !path.exists() {
            return None;
        }
        match read_snapshot(&path, index.code(), self.width) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(index = %index, error = %e, "ignoring malformed constituent snapshot");
                None
            }
        }
    }

    /// Persist a snapshot, replacing the previous one.
    pub fn save(&self, snapshot: &ConstituentSnapshot) -> Result<(), DataError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let date = snapshot
            .as_of
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        writer
            .write_record(["date", "symbol"])
            .map_err(|e| DataError::CacheError(format!("csv encode: {e}")))?;
        for member in &snapshot.members {
            writer
                .write_record([date.as_str(), member.as_str()])
                .map_err(|e| DataError::CacheError(format!("csv encode: {e}")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| DataError::CacheError(format!("csv flush: {e}")))?;
        write_atomic(&self.snapshot_path(&snapshot.index), &bytes)
    }

    /// Snapshot for `index`: from disk unless `refresh` is set or nothing is
    /// cached, otherwise from the source with retry. A failed refresh falls
    /// back to the cached snapshot.
    pub fn get(&self, index: &Symbol, refresh: bool) -> Result<ConstituentSnapshot, DataError> {
        let cached = self.cached(index);
        if !refresh {
            if let Some(snapshot) = cached.clone() {
                return Ok(snapshot);
            }
        }

        match self.fetch_with_retry(index) {
            Ok(mut snapshot) => {
                snapshot.index = index.code().to_string();
                snapshot.members = dedup_codes(snapshot.members.iter(), self.width);
                if let Err(e) = self.save(&snapshot) {
                    warn!(index = %index, error = %e, "could not cache constituent snapshot");
                }
                info!(index = %index, members = snapshot.members.len(), "constituents refreshed");
                Ok(snapshot)
            }
            Err(e) => match cached {
                Some(snapshot) => {
                    warn!(index = %index, error = %e, "refresh failed, using cached constituents");
                    Ok(snapshot)
                }
                None => Err(e),
            },
        }
    }

    fn fetch_with_retry(&self, index: &Symbol) -> Result<ConstituentSnapshot, DataError> {
        let source = self.source.ok_or_else(|| DataError::ConstituentsUnavailable {
            index: index.code().to_string(),
            reason: "no cached snapshot and no constituent source configured".into(),
        })?;

        let attempts = self.max_retries.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match source.get_constituents(index) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    warn!(index = %index, attempt = attempt + 1, error = %e, "constituent fetch failed");
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        self.pacer.pause(backoff_delay(self.base_delay, attempt));
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DataError::Other("no constituent attempt made".into())))
    }

    /// Union of members across `indexes`, deduplicated in first-seen order.
    ///
    /// Indexes whose snapshot cannot be obtained are reported alongside.
    pub fn universe(
        &self,
        indexes: &[Symbol],
        refresh: bool,
    ) -> (Vec<String>, Vec<(String, DataError)>) {
        let mut seen = HashSet::new();
        let mut members = Vec::new();
        let mut missing = Vec::new();

        for index in indexes {
            match self.get(index, refresh) {
                Ok(snapshot) => {
                    for code in snapshot.members {
                        if seen.insert(code.clone()) {
                            members.push(code);
                        }
                    }
                }
                Err(e) => missing.push((index.code().to_string(), e)),
            }
        }
        (members, missing)
    }

    /// Union of the cached snapshots only. Never touches the source.
    pub fn cached_union(&self, indexes: &[Symbol]) -> BTreeSet<String> {
        indexes
            .iter()
            .filter_map(|i| self.cached(i))
            .flat_map(|s| s.members)
            .collect()
    }
}

fn dedup_codes<'s>(codes: impl Iterator<Item = &'s String>, width: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    codes
        .map(|c| normalize_code(c, width))
        .filter(|c| !c.is_empty() && seen.insert(c.clone()))
        .collect()
}

fn find_column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
}

/// Read a snapshot file: rows at the latest date, plus undated rows.
fn read_snapshot(path: &Path, index: &str, width: usize) -> Result<ConstituentSnapshot, DataError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| DataError::CacheError(format!("open {}: {e}", path.display())))?;
    let headers = reader
        .headers()
        .map_err(|e| DataError::CacheError(format!("read header of {}: {e}", path.display())))?
        .clone();

    let code_col = find_column(&headers, CODE_HEADERS).ok_or_else(|| DataError::MissingColumn {
        column: "symbol".into(),
        context: path.display().to_string(),
    })?;
    let date_col = find_column(&headers, DATE_HEADERS);

    let mut rows: Vec<(Option<NaiveDate>, String)> = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| DataError::CacheError(format!("parse {}: {e}", path.display())))?;
        let Some(code) = record.get(code_col).map(str::trim).filter(|c| !c.is_empty()) else {
            continue;
        };
        let date = date_col.and_then(|i| record.get(i)).and_then(parse_date);
        rows.push((date, code.to_string()));
    }

    let as_of = rows.iter().filter_map(|(d, _)| *d).max();
    let latest = rows
        .iter()
        .filter(|(d, _)| d.is_none() || *d == as_of)
        .map(|(_, c)| c);

    Ok(ConstituentSnapshot {
        index: index.to_string(),
        as_of,
        members: dedup_codes(latest, width),
    })
}

/// Constituents declared in a TOML manifest, for offline runs.
///
/// ```toml
/// [indexes.399006]
/// as_of = "2024-06-28"
/// members = ["300750", "300059"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestSource {
    #[serde(default)]
    pub indexes: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    pub members: Vec<String>,
}

impl ManifestSource {
    pub fn from_file(path: &Path) -> Result<Self, DataError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DataError::Other(format!("read manifest {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, DataError> {
        let raw: Self = toml::from_str(content)
            .map_err(|e| DataError::Other(format!("parse manifest TOML: {e}")))?;
        Ok(Self {
            indexes: raw
                .indexes
                .into_iter()
                .map(|(code, entry)| (normalize_code(&code, crate::symbol::DEFAULT_SYMBOL_WIDTH), entry))
                .collect(),
        })
    }
}

impl ConstituentSource for ManifestSource {
    fn get_constituents(&self, index: &Symbol) -> Result<ConstituentSnapshot, DataError> {
        let entry = self
            .indexes
            .get(index.code())
            .ok_or_else(|| DataError::ConstituentsUnavailable {
                index: index.code().to_string(),
                reason: "not listed in manifest".into(),
            })?;
        Ok(ConstituentSnapshot {
            index: index.code().to_string(),
            as_of: entry.as_of,
            members: entry.members.clone(),
        })
    }
}
