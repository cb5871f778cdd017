//! Per-symbol fragment store.
//!
//! Layout: `{cache_dir}/{code}_{first}_{last}.csv`, where `first` and `last`
//! are the `YYYYMMDD` coverage of the series. One live fragment per symbol;
//! writing a new coverage removes the older files.
//!
//! Features:
//! - Atomic writes (write to .tmp, rename into place)
//! - Keep-last merge (incoming rows win on the same date)
//! - Fallback to the canonical dataset for `last_known_date`
//! - Quarantine for unreadable fragments ({filename}.quarantined)
//! - Eviction that refuses protected index codes
//!
//! Lookups go through an in-memory index of the cache directory. Changes
//! made through this store update the index in place; any other change to
//! the directory (detected by its mtime) triggers a rescan.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, warn};

use super::provider::DataError;
use super::table::{read_bars, remove_if_exists, write_bars};
use crate::bar::{dedup_keep_last, Bar};
use crate::symbol::{ProtectedIndexes, Symbol};

const TAG_FORMAT: &str = "%Y%m%d";

/// Parsed fragment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentName {
    pub code: String,
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl FragmentName {
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.csv",
            self.code,
            self.first.format(TAG_FORMAT),
            self.last.format(TAG_FORMAT)
        )
    }

    /// Parse `{code}_{first}_{last}.csv`. Dashed dates are accepted too.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".csv")?;
        let mut parts = stem.rsplitn(3, '_');
        let last = parse_tag(parts.next()?)?;
        let first = parse_tag(parts.next()?)?;
        let code = parts.next()?;
        if code.is_empty() {
            return None;
        }
        Some(Self {
            code: code.to_string(),
            first,
            last,
        })
    }
}

fn parse_tag(tag: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(tag, TAG_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(tag, "%Y-%m-%d"))
        .ok()
}

/// A fragment on disk, for status and maintenance reports.
#[derive(Debug, Clone)]
pub struct FragmentInfo {
    pub name: FragmentName,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
}

/// Last date per symbol in the canonical dataset, tagged with the file
/// stamp it was computed from.
struct CanonicalIndex {
    stamp: (Option<SystemTime>, u64),
    last_dates: HashMap<String, NaiveDate>,
}

/// Fragments per code, each list sorted by coverage end, tagged with the
/// cache directory mtime it was built from.
struct FragmentIndex {
    stamp: Option<SystemTime>,
    by_code: BTreeMap<String, Vec<FragmentInfo>>,
}

/// The symbol cache store.
pub struct FragmentStore {
    cache_dir: PathBuf,
    canonical_path: PathBuf,
    protected: ProtectedIndexes,
    canonical_index: Mutex<Option<CanonicalIndex>>,
    fragment_index: Mutex<Option<FragmentIndex>>,
}

impl FragmentStore {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        canonical_path: impl Into<PathBuf>,
        protected: ProtectedIndexes,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            canonical_path: canonical_path.into(),
            protected,
            canonical_index: Mutex::new(None),
            fragment_index: Mutex::new(None),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical_path
    }

    pub fn protected(&self) -> &ProtectedIndexes {
        &self.protected
    }

    /// Every fragment in the cache directory, sorted by code then coverage end.
    pub fn fragments(&self) -> Vec<FragmentInfo> {
        self.with_index(|by_code| by_code.values().flatten().cloned().collect())
    }

    fn fragments_of(&self, code: &str) -> Vec<FragmentInfo> {
        self.with_index(|by_code| by_code.get(code).cloned().unwrap_or_default())
    }

    /// Path of the live fragment for `code`: the one with the latest coverage.
    pub fn fragment_path(&self, code: &str) -> Option<PathBuf> {
        self.with_index(|by_code| {
            by_code
                .get(code)
                .and_then(|list| list.last())
                .map(|f| f.path.clone())
        })
    }

    fn lock_index(&self) -> MutexGuard<'_, Option<FragmentIndex>> {
        match self.fragment_index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn dir_stamp(&self) -> Option<SystemTime> {
        fs::metadata(&self.cache_dir).and_then(|m| m.modified()).ok()
    }

    /// Run `f` over a current index, rescanning when the directory changed.
    fn with_index<R>(&self, f: impl FnOnce(&BTreeMap<String, Vec<FragmentInfo>>) -> R) -> R {
        let stamp = self.dir_stamp();
        let mut guard = self.lock_index();
        let stale = guard
            .as_ref()
            .map_or(true, |idx| stamp.is_none() || idx.stamp != stamp);
        if stale {
            *guard = None;
        }
        let index = guard.get_or_insert_with(|| FragmentIndex {
            stamp,
            by_code: self.scan_fragments(),
        });
        f(&index.by_code)
    }

    /// Replace the index entry of `code` after this store changed its files.
    ///
    /// The list must be taken before the change, since the change itself
    /// moves the directory stamp. Assumes one writer per cache directory:
    /// a foreign write landing between the change and the new stamp is not
    /// seen until the directory changes again.
    fn reindex(&self, code: &str, live: Vec<FragmentInfo>) {
        let stamp = self.dir_stamp();
        let mut guard = self.lock_index();
        if let Some(index) = guard.as_mut() {
            if live.is_empty() {
                index.by_code.remove(code);
            } else {
                index.by_code.insert(code.to_string(), live);
            }
            index.stamp = stamp;
        }
    }

    fn scan_fragments(&self) -> BTreeMap<String, Vec<FragmentInfo>> {
        let mut by_code: BTreeMap<String, Vec<FragmentInfo>> = BTreeMap::new();
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return by_code;
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            if let Some(name) = FragmentName::parse(&file_name.to_string_lossy()) {
                by_code
                    .entry(name.code.clone())
                    .or_default()
                    .push(fragment_info(name, entry.path()));
            }
        }
        for list in by_code.values_mut() {
            list.sort_by(|a, b| (a.name.last, a.name.first).cmp(&(b.name.last, b.name.first)));
        }
        debug!(dir = %self.cache_dir.display(), symbols = by_code.len(), "fragment index rebuilt");
        by_code
    }

    /// Codes that currently have at least one fragment.
    pub fn cached_symbols(&self) -> BTreeSet<String> {
        self.with_index(|by_code| by_code.keys().cloned().collect())
    }

    /// Load the symbol's own fragment. Missing or unreadable means empty.
    pub fn load(&self, symbol: &Symbol) -> Vec<Bar> {
        let Some(path) = self.fragment_path(symbol.code()) else {
            return Vec::new();
        };

        match read_bars(&path) {
            Ok(bars) => stamp(symbol, bars),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "quarantining unreadable fragment");
                let mut quarantine = path.clone().into_os_string();
                quarantine.push(".quarantined");
                let others: Vec<FragmentInfo> = self
                    .fragments_of(symbol.code())
                    .into_iter()
                    .filter(|f| f.path != path)
                    .collect();
                match fs::rename(&path, &quarantine) {
                    Ok(()) => self.reindex(symbol.code(), others),
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to quarantine fragment"
                    ),
                }
                Vec::new()
            }
        }
    }

    /// The symbol's fragment, or its rows in the canonical dataset when it
    /// has no fragment yet.
    pub fn load_with_fallback(&self, symbol: &Symbol) -> Vec<Bar> {
        let own = self.load(symbol);
        if own.is_empty() {
            self.canonical_rows(symbol.code())
        } else {
            own
        }
    }

    /// Rows of `code` in the canonical dataset, sorted by date.
    pub fn canonical_rows(&self, code: &str) -> Vec<Bar> {
        if !self.canonical_path.exists() {
            return Vec::new();
        }
        match read_bars(&self.canonical_path) {
            Ok(rows) => dedup_keep_last(rows.into_iter().filter(|b| b.symbol == code).collect()),
            Err(e) => {
                warn!(error = %e, "canonical dataset unreadable");
                Vec::new()
            }
        }
    }

    /// Latest stored date for a symbol.
    ///
    /// Checks the fragment first, then the canonical dataset; when both have
    /// rows the later date wins.
    pub fn last_known_date(&self, symbol: &Symbol) -> Option<NaiveDate> {
        let from_fragment = self.load(symbol).last().map(|b| b.date);
        let from_canonical = self.canonical_last_date(symbol.code());
        from_fragment.max(from_canonical)
    }

    /// Rescans the canonical dataset only when its size or mtime changed.
    fn canonical_last_date(&self, code: &str) -> Option<NaiveDate> {
        let meta = fs::metadata(&self.canonical_path).ok()?;
        let stamp = (meta.modified().ok(), meta.len());

        let mut guard = match self.canonical_index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_ref().map_or(true, |idx| idx.stamp != stamp) {
            *guard = Some(CanonicalIndex {
                stamp,
                last_dates: self.scan_canonical(),
            });
        }
        guard
            .as_ref()
            .and_then(|idx| idx.last_dates.get(code).copied())
    }

    fn scan_canonical(&self) -> HashMap<String, NaiveDate> {
        let mut last_dates: HashMap<String, NaiveDate> = HashMap::new();
        match read_bars(&self.canonical_path) {
            Ok(rows) => {
                for row in rows {
                    let entry = last_dates.entry(row.symbol).or_insert(row.date);
                    if row.date > *entry {
                        *entry = row.date;
                    }
                }
            }
            Err(e) => warn!(error = %e, "canonical dataset unreadable"),
        }
        last_dates
    }

    /// Merge `new_rows` into the symbol's fragment and persist it.
    ///
    /// Existing rows come first and new rows last, so the newly fetched row
    /// wins on a date conflict. Merging the same rows twice is a no-op on
    /// the stored series.
    pub fn merge(&self, symbol: &Symbol, new_rows: Vec<Bar>) -> Result<Vec<Bar>, DataError> {
        let existing = self.load(symbol);
        let mut all = existing;
        all.extend(stamp(symbol, new_rows));
        let merged = dedup_keep_last(all);

        let (Some(first), Some(last)) = (merged.first(), merged.last()) else {
            return Ok(merged);
        };

        let name = FragmentName {
            code: symbol.code().to_string(),
            first: first.date,
            last: last.date,
        };
        let path = self.cache_dir.join(name.file_name());
        let previous = self.fragments_of(symbol.code());
        write_bars(&path, &merged)?;

        let mut live = Vec::new();
        for stale in previous {
            if stale.path == path {
                continue;
            }
            if let Err(e) = remove_if_exists(&stale.path) {
                warn!(path = %stale.path.display(), error = %e, "failed to remove superseded fragment");
                live.push(stale);
            }
        }
        live.push(fragment_info(name, path));
        live.sort_by(|a, b| (a.name.last, a.name.first).cmp(&(b.name.last, b.name.first)));
        self.reindex(symbol.code(), live);

        debug!(symbol = %symbol, rows = merged.len(), "fragment merged");
        Ok(merged)
    }

    /// Remove every fragment of `code`. Protected index codes are refused.
    ///
    /// Returns the number of files removed.
    pub fn evict(&self, code: &str) -> Result<usize, DataError> {
        if self.protected.contains(code) {
            return Err(DataError::ProtectedSymbol {
                symbol: code.to_string(),
            });
        }

        let mut removed = 0;
        let mut remaining = self.fragments_of(code).into_iter();
        while let Some(fragment) = remaining.next() {
            match remove_if_exists(&fragment.path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    let mut live = vec![fragment.clone()];
                    live.extend(remaining);
                    self.reindex(code, live);
                    return Err(DataError::CacheError(format!(
                        "failed to remove {}: {e}",
                        fragment.path.display()
                    )));
                }
            }
        }
        self.reindex(code, Vec::new());
        Ok(removed)
    }
}

fn fragment_info(name: FragmentName, path: PathBuf) -> FragmentInfo {
    let meta = fs::metadata(&path).ok();
    FragmentInfo {
        name,
        size_bytes: meta.as_ref().map(|m| m.len()).unwrap_or(0),
        modified: meta.and_then(|m| m.modified().ok()),
        path,
    }
}

/// Force the symbol column to the canonical code.
fn stamp(symbol: &Symbol, mut bars: Vec<Bar>) -> Vec<Bar> {
    for bar in &mut bars {
        if bar.symbol != symbol.code() {
            bar.symbol = symbol.code().to_string();
        }
    }
    bars
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_store() -> (FragmentStore, PathBuf) {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let root = std::env::temp_dir().join(format!(
            "barvault_store_test_{}_{id}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let store = FragmentStore::new(
            root.join("price_cache"),
            root.join("prices.csv"),
            ProtectedIndexes::new([("399006", "ChiNext")]),
        );
        (store, root)
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn bars(code: &str, days: &[u32]) -> Vec<Bar> {
        days.iter()
            .map(|&day| Bar::new(code, d(day), 1.0, 1.0, 1.0, day as f64, 10.0))
            .collect()
    }

    #[test]
    fn fragment_name_round_trip() {
        let name = FragmentName {
            code: "000001".into(),
            first: d(2),
            last: d(31),
        };
        assert_eq!(name.file_name(), "000001_20240102_20240131.csv");
        assert_eq!(FragmentName::parse(&name.file_name()), Some(name));
        assert_eq!(
            FragmentName::parse("600000_2010-01-01_2024-01-05.csv").map(|n| n.code),
            Some("600000".to_string())
        );
        assert_eq!(FragmentName::parse("prices.csv"), None);
        assert_eq!(FragmentName::parse("000001_x_y.csv"), None);
    }

    #[test]
    fn first_merge_creates_fragment() {
        let (store, root) = temp_store();
        let sym = Symbol::stock("000001");

        let merged = store.merge(&sym, bars("000001", &[3, 2, 4])).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].date, d(2));

        let path = store.fragment_path("000001").unwrap();
        assert!(path.ends_with("000001_20240102_20240104.csv"));
        assert_eq!(store.last_known_date(&sym), Some(d(4)));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn merge_is_idempotent() {
        let (store, root) = temp_store();
        let sym = Symbol::stock("000001");
        store.merge(&sym, bars("000001", &[2, 3])).unwrap();

        let once = store.merge(&sym, bars("000001", &[3, 4])).unwrap();
        let twice = store.merge(&sym, bars("000001", &[3, 4])).unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.load(&sym), once);
        assert_eq!(store.fragments().len(), 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn newer_rows_replace_existing_dates() {
        let (store, root) = temp_store();
        let sym = Symbol::stock("000001");
        store.merge(&sym, bars("000001", &[2, 3])).unwrap();

        let mut revised = bars("000001", &[3]);
        revised[0].close = 42.0;
        let merged = store.merge(&sym, revised).unwrap();

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].close, 42.0);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn superseded_fragments_are_removed() {
        let (store, root) = temp_store();
        let sym = Symbol::stock("000001");
        store.merge(&sym, bars("000001", &[2])).unwrap();
        store.merge(&sym, bars("000001", &[5])).unwrap();

        let files = store.fragments();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name.last, d(5));
        assert_eq!(files[0].name.first, d(2));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn last_known_date_falls_back_to_canonical() {
        let (store, root) = temp_store();
        let canonical = "date,symbol,open,high,low,close,volume\n\
                         2024-01-08,000002,1,1,1,1,1\n\
                         2024-01-09,000002,1,1,1,1,1\n\
                         2024-01-09,000003,1,1,1,1,1\n";
        fs::write(store.canonical_path(), canonical).unwrap();

        let sym = Symbol::stock("000002");
        assert_eq!(store.last_known_date(&sym), Some(d(9)));
        assert_eq!(store.load(&sym).len(), 0);
        assert_eq!(store.load_with_fallback(&sym).len(), 2);

        // A fragment that ends later than the canonical rows wins
        store.merge(&sym, bars("000002", &[12])).unwrap();
        assert_eq!(store.last_known_date(&sym), Some(d(12)));

        // ...and the canonical date wins when it is the later one
        let other = Symbol::stock("000003");
        store.merge(&other, bars("000003", &[4])).unwrap();
        assert_eq!(store.last_known_date(&other), Some(d(9)));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn unreadable_fragment_is_quarantined() {
        let (store, root) = temp_store();
        fs::create_dir_all(store.cache_dir()).unwrap();
        let path = store.cache_dir().join("000001_20240102_20240103.csv");
        fs::write(&path, "symbol,close\n000001,1\n").unwrap();

        let sym = Symbol::stock("000001");
        assert!(store.load(&sym).is_empty());
        assert!(!path.exists());
        assert!(store
            .cache_dir()
            .join("000001_20240102_20240103.csv.quarantined")
            .exists());
        assert!(store.cached_symbols().is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn failed_quarantine_leaves_fragment_in_place() {
        let (store, root) = temp_store();
        fs::create_dir_all(store.cache_dir()).unwrap();
        let path = store.cache_dir().join("000001_20240102_20240103.csv");
        fs::write(&path, "symbol,close\n000001,1\n").unwrap();

        // A non-empty directory at the quarantine name makes the rename fail
        let blocker = store
            .cache_dir()
            .join("000001_20240102_20240103.csv.quarantined");
        fs::create_dir_all(&blocker).unwrap();
        fs::write(blocker.join("keep"), "x").unwrap();

        let sym = Symbol::stock("000001");
        assert!(store.load(&sym).is_empty());
        assert!(path.exists());
        assert!(blocker.is_dir());
        assert!(store.cached_symbols().contains("000001"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn index_follows_own_merges_and_evictions() {
        let (store, root) = temp_store();
        for code in ["000001", "000002", "000003"] {
            store.merge(&Symbol::stock(code), bars(code, &[2, 3])).unwrap();
        }
        store
            .merge(&Symbol::stock("000002"), bars("000002", &[4]))
            .unwrap();
        store.evict("000003").unwrap();

        let cached: Vec<String> = store.cached_symbols().into_iter().collect();
        assert_eq!(cached, vec!["000001".to_string(), "000002".to_string()]);
        assert!(store
            .fragment_path("000002")
            .unwrap()
            .ends_with("000002_20240102_20240104.csv"));
        assert_eq!(store.fragment_path("000003"), None);

        // The same answers as a cold scan of the directory
        let cold = FragmentStore::new(
            store.cache_dir(),
            store.canonical_path(),
            ProtectedIndexes::default(),
        );
        let warm: Vec<PathBuf> = store.fragments().into_iter().map(|f| f.path).collect();
        let scanned: Vec<PathBuf> = cold.fragments().into_iter().map(|f| f.path).collect();
        assert_eq!(warm, scanned);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn index_picks_up_foreign_writes() {
        let (store, root) = temp_store();
        store
            .merge(&Symbol::stock("000001"), bars("000001", &[2]))
            .unwrap();
        assert_eq!(store.cached_symbols().len(), 1);

        // Directory mtimes tick at scheduler granularity
        std::thread::sleep(std::time::Duration::from_millis(50));
        let other = FragmentStore::new(
            store.cache_dir(),
            store.canonical_path(),
            ProtectedIndexes::default(),
        );
        other
            .merge(&Symbol::stock("000002"), bars("000002", &[2, 3]))
            .unwrap();

        assert!(store.cached_symbols().contains("000002"));
        assert_eq!(store.load(&Symbol::stock("000002")).len(), 2);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn evict_refuses_protected_codes() {
        let (store, root) = temp_store();
        store
            .merge(&Symbol::index("399006"), bars("399006", &[2]))
            .unwrap();
        store
            .merge(&Symbol::stock("000001"), bars("000001", &[2]))
            .unwrap();

        assert!(matches!(
            store.evict("399006"),
            Err(DataError::ProtectedSymbol { .. })
        ));
        assert_eq!(store.evict("000001").unwrap(), 1);
        assert_eq!(store.evict("000001").unwrap(), 0);

        let cached: Vec<String> = store.cached_symbols().into_iter().collect();
        assert_eq!(cached, vec!["399006".to_string()]);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn merge_stamps_canonical_symbol() {
        let (store, root) = temp_store();
        let sym = Symbol::stock("000001");
        let merged = store.merge(&sym, bars("1", &[2])).unwrap();
        assert_eq!(merged[0].symbol, "000001");

        let _ = fs::remove_dir_all(&root);
    }
}
