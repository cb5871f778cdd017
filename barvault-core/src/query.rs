//! Read API over the archive.
//!
//! Reads the canonical dataset, or the union of fragments when no readable
//! dataset exists. A date window that misses the data is widened to the
//! nearest available rows instead of coming back empty.

use chrono::NaiveDate;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::bar::{dedup_keep_last, Bar};
use crate::config::{ArchiveConfig, ArchiveLayout};
use crate::data::constituents::ConstituentCache;
use crate::data::pacing::ThreadPacer;
use crate::data::provider::DataError;
use crate::data::store::FragmentStore;
use crate::data::table::read_bars;
use crate::symbol::{normalize_code, ProtectedIndexes};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Bar>,
    pub effective_start: NaiveDate,
    pub effective_end: NaiveDate,
    /// The requested window held no rows and was moved.
    pub widened: bool,
}

pub struct ArchiveReader {
    layout: ArchiveLayout,
    protected: ProtectedIndexes,
    width: usize,
}

impl ArchiveReader {
    pub fn new(layout: ArchiveLayout, protected: ProtectedIndexes, width: usize) -> Self {
        Self {
            layout,
            protected,
            width,
        }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(
            config.layout(),
            config.protected_indexes(),
            config.download.symbol_width,
        )
    }

    /// Rows for `symbols` (all when empty) over `[start, end]`.
    pub fn query<S: AsRef<str>>(
        &self,
        symbols: &[S],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<QueryResult, DataError> {
        let wanted: BTreeSet<String> = symbols
            .iter()
            .map(|s| normalize_code(s.as_ref(), self.width))
            .collect();

        let selected: Vec<Bar> = self
            .load_all()
            .into_iter()
            .filter(|b| wanted.is_empty() || wanted.contains(&b.symbol))
            .collect();

        let exact = QueryResult {
            rows: in_window(&selected, start, end),
            effective_start: start,
            effective_end: end,
            widened: false,
        };
        if !exact.rows.is_empty() || selected.is_empty() || start > end {
            return Ok(exact);
        }

        let Some((effective_start, effective_end)) = widen(&selected, start, end) else {
            return Ok(exact);
        };
        debug!(%start, %end, %effective_start, %effective_end, "query window widened");
        Ok(QueryResult {
            rows: in_window(&selected, effective_start, effective_end),
            effective_start,
            effective_end,
            widened: true,
        })
    }

    /// Symbols with data in the archive.
    pub fn symbols(&self) -> BTreeSet<String> {
        self.load_all().into_iter().map(|b| b.symbol).collect()
    }

    /// Union of the cached constituent snapshots.
    pub fn universe(&self) -> BTreeSet<String> {
        ConstituentCache::new(self.layout.constituents_dir(), &ThreadPacer)
            .with_width(self.width)
            .cached_union(&self.protected.symbols())
    }

    fn load_all(&self) -> Vec<Bar> {
        let canonical = self.layout.canonical_path();
        if canonical.exists() {
            match read_bars(&canonical) {
                Ok(rows) => return rows,
                Err(e) => warn!(error = %e, "canonical dataset unreadable, reading fragments"),
            }
        }

        let store = FragmentStore::new(
            self.layout.price_cache_dir(),
            &canonical,
            self.protected.clone(),
        );
        let mut rows = Vec::new();
        for fragment in store.fragments() {
            match read_bars(&fragment.path) {
                Ok(mut bars) => {
                    for bar in &mut bars {
                        if bar.symbol.is_empty() {
                            bar.symbol = fragment.name.code.clone();
                        }
                    }
                    rows.extend(bars);
                }
                Err(e) => warn!(path = %fragment.path.display(), error = %e, "skipping unreadable fragment"),
            }
        }
        dedup_keep_last(rows)
    }
}

fn in_window(rows: &[Bar], start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
    rows.iter()
        .filter(|b| b.date >= start && b.date <= end)
        .cloned()
        .collect()
}

/// Nearest window with data for a request that found none.
///
/// Before the data: same length from the earliest date. After the data: same
/// length ending at the latest date. Inside a gap: the closest dates on
/// either side.
fn widen(rows: &[Bar], start: NaiveDate, end: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let earliest = rows.iter().map(|b| b.date).min()?;
    let latest = rows.iter().map(|b| b.date).max()?;
    let span = end.signed_duration_since(start);

    // Spans reaching past the calendar range clamp to the data bounds.
    if end < earliest {
        Some((earliest, earliest.checked_add_signed(span).unwrap_or(latest)))
    } else if start > latest {
        Some((latest.checked_sub_signed(span).unwrap_or(earliest), latest))
    } else {
        let before = rows.iter().map(|b| b.date).filter(|d| *d < start).max()?;
        let after = rows.iter().map(|b| b.date).filter(|d| *d > end).min()?;
        Some((before, after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::table::write_bars;
    use tempfile::tempdir;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn bar(sym: &str, date: NaiveDate) -> Bar {
        Bar::new(sym, date, 1.0, 1.0, 1.0, 1.0, 1.0)
    }

    fn reader(dir: &std::path::Path) -> ArchiveReader {
        ArchiveReader::new(ArchiveLayout::new(dir), ProtectedIndexes::default(), 6)
    }

    #[test]
    fn widen_cases() {
        let rows = vec![bar("1", d(3, 1)), bar("1", d(3, 5)), bar("1", d(3, 20))];
        assert_eq!(widen(&rows, d(1, 1), d(1, 10)), Some((d(3, 1), d(3, 10))));
        assert_eq!(widen(&rows, d(5, 1), d(5, 11)), Some((d(3, 10), d(3, 20))));
        assert_eq!(widen(&rows, d(3, 8), d(3, 12)), Some((d(3, 5), d(3, 20))));
    }

    #[test]
    fn widen_clamps_extreme_windows() {
        let rows = vec![bar("1", d(3, 1)), bar("1", d(3, 20))];
        assert_eq!(
            widen(&rows, NaiveDate::MIN, d(1, 1)),
            Some((d(3, 1), d(3, 20)))
        );
        assert_eq!(
            widen(&rows, d(5, 1), NaiveDate::MAX),
            Some((d(3, 1), d(3, 20)))
        );
    }

    #[test]
    fn exact_window_and_symbol_filter() {
        let dir = tempdir().unwrap();
        write_bars(
            &dir.path().join("prices.csv"),
            &[bar("000001", d(1, 2)), bar("000001", d(1, 3)), bar("000002", d(1, 2))],
        )
        .unwrap();

        let result = reader(dir.path()).query(&["1"], d(1, 1), d(1, 2)).unwrap();
        assert!(!result.widened);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].symbol, "000001");

        let all = reader(dir.path()).query::<&str>(&[], d(1, 1), d(1, 31)).unwrap();
        assert_eq!(all.rows.len(), 3);
    }

    #[test]
    fn unknown_symbol_is_empty_not_widened() {
        let dir = tempdir().unwrap();
        write_bars(&dir.path().join("prices.csv"), &[bar("000001", d(1, 2))]).unwrap();
        let result = reader(dir.path()).query(&["000009"], d(1, 1), d(1, 5)).unwrap();
        assert!(result.rows.is_empty());
        assert!(!result.widened);
    }

    #[test]
    fn falls_back_to_fragments() {
        let dir = tempdir().unwrap();
        write_bars(
            &dir.path().join("price_cache").join("000003_20240102_20240103.csv"),
            &[bar("000003", d(1, 2)), bar("000003", d(1, 3))],
        )
        .unwrap();

        let r = reader(dir.path());
        assert_eq!(r.symbols().into_iter().collect::<Vec<_>>(), vec!["000003"]);
        let result = r.query(&["000003"], d(1, 1), d(1, 31)).unwrap();
        assert_eq!(result.rows.len(), 2);
    }
}
