//! Consolidation of fragments into the canonical dataset, and cache cleanup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::scheduler::{batch_fragment_path, RETRY_BATCH};
use crate::bar::{dedup_keep_last, Bar};
use crate::data::provider::DataError;
use crate::data::store::FragmentStore;
use crate::data::table::{encode_canonical, read_bars, remove_if_exists, write_atomic};
use crate::symbol::Symbol;

/// Outcome of one consolidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub rows: usize,
    pub symbols: usize,
    pub fragments_loaded: usize,
    pub fragments_skipped: usize,
    /// blake3 hex digest of the written dataset.
    pub content_hash: String,
}

/// Builds `prices.csv` from the previous dataset, the batch fragments and
/// the protected index fragments.
pub struct Consolidator<'a> {
    store: &'a FragmentStore,
    data_dir: PathBuf,
}

impl<'a> Consolidator<'a> {
    pub fn new(store: &'a FragmentStore, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            data_dir: data_dir.into(),
        }
    }

    pub fn canonical_path(&self) -> &Path {
        self.store.canonical_path()
    }

    /// Merge every layer into the canonical dataset.
    ///
    /// Layers, later ones winning on (symbol, date): the existing dataset
    /// (restricted to `retain` when given), the retry fragment and batch
    /// fragments `1..=total_batches`, then each protected index fragment.
    /// Batch fragments are removed once the dataset is written.
    pub fn consolidate(
        &self,
        total_batches: usize,
        retain: Option<&BTreeSet<String>>,
    ) -> Result<ConsolidationReport, DataError> {
        let mut rows: Vec<Bar> = Vec::new();
        let mut loaded = 0usize;
        let mut skipped = 0usize;

        let canonical = self.store.canonical_path();
        if canonical.exists() {
            match read_bars(canonical) {
                Ok(existing) => {
                    let before = existing.len();
                    rows.extend(
                        existing
                            .into_iter()
                            .filter(|b| retain.map_or(true, |keep| keep.contains(&b.symbol))),
                    );
                    info!(kept = rows.len(), dropped = before - rows.len(), "loaded previous dataset");
                    loaded += 1;
                }
                Err(e) => {
                    warn!(error = %e, "previous dataset unreadable, rebuilding from fragments");
                    skipped += 1;
                }
            }
        }

        let batch_paths: Vec<PathBuf> = (RETRY_BATCH..=total_batches)
            .map(|b| batch_fragment_path(&self.data_dir, b))
            .collect();
        for path in &batch_paths {
            if !path.exists() {
                continue;
            }
            match read_bars(path) {
                Ok(batch) => {
                    rows.extend(batch);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable batch fragment");
                    skipped += 1;
                }
            }
        }

        for symbol in self.store.protected().symbols() {
            if self.store.fragment_path(symbol.code()).is_none() {
                continue;
            }
            let series = self.store.load(&symbol);
            if series.is_empty() {
                skipped += 1;
                continue;
            }
            rows.extend(series);
            loaded += 1;
        }

        if rows.is_empty() {
            return Err(DataError::NothingToConsolidate);
        }

        let merged = dedup_keep_last(rows);
        let bytes = encode_canonical(&merged)?;
        write_atomic(canonical, &bytes)?;

        let symbols = merged
            .iter()
            .map(|b| b.symbol.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let report = ConsolidationReport {
            rows: merged.len(),
            symbols,
            fragments_loaded: loaded,
            fragments_skipped: skipped,
            content_hash: blake3::hash(&bytes).to_hex().to_string(),
        };
        info!(
            rows = report.rows,
            symbols = report.symbols,
            loaded,
            skipped,
            "canonical dataset written"
        );

        for path in &batch_paths {
            if let Err(e) = remove_if_exists(path) {
                warn!(path = %path.display(), error = %e, "failed to remove batch fragment");
            }
        }

        Ok(report)
    }
}

/// Eviction of fragments that left the universe.
pub struct Cleanup<'a> {
    store: &'a FragmentStore,
}

impl<'a> Cleanup<'a> {
    pub fn new(store: &'a FragmentStore) -> Self {
        Self { store }
    }

    /// Evict every cached symbol outside `union` that is not protected.
    ///
    /// An empty union evicts nothing. Returns the evicted codes.
    pub fn evict_stale(&self, union: &BTreeSet<String>) -> Vec<String> {
        if union.is_empty() {
            warn!("constituent union is empty, skipping eviction");
            return Vec::new();
        }

        let mut evicted = Vec::new();
        for code in self.store.cached_symbols() {
            if union.contains(&code) || self.store.protected().contains(&code) {
                continue;
            }
            match self.store.evict(&code) {
                Ok(_) => evicted.push(code),
                Err(e) => warn!(symbol = %code, error = %e, "eviction failed"),
            }
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted stale fragments");
        }
        evicted
    }
}

/// Every `prices_batch_{b}.csv` in `data_dir`, with its batch number.
fn batch_fragments(data_dir: &Path) -> Vec<(usize, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(data_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name();
            let batch = name
                .to_str()?
                .strip_prefix("prices_batch_")?
                .strip_suffix(".csv")?
                .parse::<usize>()
                .ok()?;
            Some((batch, e.path()))
        })
        .collect()
}

/// Highest `b` among the `prices_batch_{b}.csv` files in `data_dir`, 0 if none.
pub fn highest_batch_fragment(data_dir: &Path) -> usize {
    batch_fragments(data_dir)
        .into_iter()
        .map(|(b, _)| b)
        .max()
        .unwrap_or(0)
}

/// Delete every batch fragment in `data_dir`. Returns how many were removed.
pub fn remove_batch_fragments(data_dir: &Path) -> usize {
    let mut removed = 0;
    for (batch, path) in batch_fragments(data_dir) {
        match remove_if_exists(&path) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => warn!(batch, path = %path.display(), error = %e, "failed to remove batch fragment"),
        }
    }
    removed
}

/// The set a consolidation keeps from the previous dataset: the universe
/// plus every protected index.
pub fn retain_set<'s>(
    universe: impl IntoIterator<Item = &'s Symbol>,
    store: &FragmentStore,
) -> BTreeSet<String> {
    universe
        .into_iter()
        .map(|s| s.code().to_string())
        .chain(store.protected().codes().map(str::to_string))
        .collect()
}
