//! Archive integrity report.
//!
//! Cross-checks constituent snapshots, cached fragments and the canonical
//! dataset without touching the network.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::data::constituents::ConstituentCache;
use crate::data::store::FragmentStore;
use crate::data::table::read_bars;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexIntegrity {
    pub index: String,
    pub name: Option<String>,
    pub snapshot_present: bool,
    pub member_count: usize,
    pub snapshot_date: Option<NaiveDate>,
    pub members_without_fragment: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub indexes: Vec<IndexIntegrity>,
    pub universe_size: usize,
    pub dataset_present: bool,
    pub dataset_symbols: usize,
    pub dataset_rows: usize,
    /// Universe members with no rows in the canonical dataset.
    pub missing_from_dataset: Vec<String>,
    /// Dataset symbols that are neither universe members nor protected.
    pub outside_universe: Vec<String>,
    pub stock_fragments: usize,
    pub index_fragments: usize,
}

impl IntegrityReport {
    pub fn build(store: &FragmentStore, constituents: &ConstituentCache<'_>) -> Self {
        let protected = store.protected();
        let cached = store.cached_symbols();

        let mut universe = BTreeSet::new();
        let indexes: Vec<IndexIntegrity> = protected
            .symbols()
            .iter()
            .map(|index| {
                let snapshot = constituents.cached(index);
                let members = snapshot.as_ref().map(|s| s.members.clone()).unwrap_or_default();
                universe.extend(members.iter().cloned());
                IndexIntegrity {
                    index: index.code().to_string(),
                    name: protected.name(index.code()).map(str::to_string),
                    snapshot_present: snapshot.is_some(),
                    member_count: members.len(),
                    snapshot_date: snapshot.and_then(|s| s.as_of),
                    members_without_fragment: members
                        .into_iter()
                        .filter(|m| !cached.contains(m))
                        .collect(),
                }
            })
            .collect();

        let canonical = store.canonical_path();
        let rows = if canonical.exists() {
            read_bars(canonical).ok()
        } else {
            None
        };
        let dataset_present = rows.is_some();
        let rows = rows.unwrap_or_default();
        let dataset: BTreeSet<String> = rows.iter().map(|b| b.symbol.clone()).collect();

        let missing_from_dataset = if dataset_present {
            universe.difference(&dataset).cloned().collect()
        } else {
            Vec::new()
        };
        let outside_universe = dataset
            .iter()
            .filter(|s| !universe.contains(*s) && !protected.contains(s))
            .cloned()
            .collect();

        let index_fragments = cached.iter().filter(|c| protected.contains(c)).count();

        Self {
            indexes,
            universe_size: universe.len(),
            dataset_present,
            dataset_symbols: dataset.len(),
            dataset_rows: rows.len(),
            missing_from_dataset,
            outside_universe,
            stock_fragments: cached.len() - index_fragments,
            index_fragments,
        }
    }

    /// No member is missing anywhere and the dataset holds nothing extra.
    pub fn is_clean(&self) -> bool {
        self.dataset_present
            && self.missing_from_dataset.is_empty()
            && self.outside_universe.is_empty()
            && self
                .indexes
                .iter()
                .all(|i| i.snapshot_present && i.members_without_fragment.is_empty())
    }
}
