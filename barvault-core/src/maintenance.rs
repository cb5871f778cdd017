//! Cache maintenance: status report and age-based cleanup.
//!
//! Cleanup is two-step: [`clean_older_than`] selects, [`purge`] deletes.
//! Protected index fragments are never selected.

use chrono::NaiveDate;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::data::store::{FragmentInfo, FragmentStore};
use crate::data::table::remove_if_exists;

/// One cached fragment as shown in a status listing.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolCoverage {
    pub code: String,
    pub first: NaiveDate,
    pub last: NaiveDate,
    pub size_bytes: u64,
    pub protected: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub fragment_count: usize,
    pub total_bytes: u64,
    pub oldest: Option<SystemTime>,
    pub newest: Option<SystemTime>,
    pub symbols: Vec<SymbolCoverage>,
}

pub fn cache_stats(store: &FragmentStore) -> CacheStats {
    let fragments = store.fragments();
    let mut stats = CacheStats {
        fragment_count: fragments.len(),
        ..CacheStats::default()
    };

    for fragment in fragments {
        stats.total_bytes += fragment.size_bytes;
        if let Some(modified) = fragment.modified {
            stats.oldest = Some(stats.oldest.map_or(modified, |o| o.min(modified)));
            stats.newest = Some(stats.newest.map_or(modified, |n| n.max(modified)));
        }
        stats.symbols.push(SymbolCoverage {
            protected: store.protected().contains(&fragment.name.code),
            code: fragment.name.code,
            first: fragment.name.first,
            last: fragment.name.last,
            size_bytes: fragment.size_bytes,
        });
    }
    stats
}

/// Unprotected fragments last written more than `days` before `now`.
pub fn clean_older_than(store: &FragmentStore, days: u64, now: SystemTime) -> Vec<FragmentInfo> {
    let cutoff = now
        .checked_sub(Duration::from_secs(days.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    store
        .fragments()
        .into_iter()
        .filter(|f| !store.protected().contains(&f.name.code))
        .filter(|f| f.modified.is_some_and(|m| m < cutoff))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub bytes_freed: u64,
}

/// Delete the given fragments. Protected codes are skipped.
pub fn purge(store: &FragmentStore, fragments: &[FragmentInfo]) -> PurgeReport {
    let mut report = PurgeReport::default();
    for fragment in fragments {
        let code = &fragment.name.code;
        if store.protected().contains(code) {
            warn!(symbol = %code, "not purging protected index");
            continue;
        }
        match remove_if_exists(&fragment.path) {
            Ok(_) => {
                report.removed.push(code.clone());
                report.bytes_freed += fragment.size_bytes;
            }
            Err(e) => {
                warn!(path = %fragment.path.display(), error = %e, "purge failed");
                report.failed.push(code.clone());
            }
        }
    }
    info!(removed = report.removed.len(), failed = report.failed.len(), "purge complete");
    report
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Bar;
    use crate::symbol::{ProtectedIndexes, Symbol};
    use tempfile::tempdir;

    fn populated(dir: &std::path::Path) -> FragmentStore {
        let store = FragmentStore::new(
            dir.join("price_cache"),
            dir.join("prices.csv"),
            ProtectedIndexes::new([("399006", "ChiNext")]),
        );
        let d = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        for sym in [Symbol::stock("000001"), Symbol::stock("000002"), Symbol::index("399006")] {
            let code = sym.code().to_string();
            store
                .merge(&sym, vec![Bar::new(code, d, 1.0, 1.0, 1.0, 1.0, 1.0)])
                .unwrap();
        }
        store
    }

    #[test]
    fn stats_cover_every_fragment() {
        let dir = tempdir().unwrap();
        let store = populated(dir.path());
        let stats = cache_stats(&store);

        assert_eq!(stats.fragment_count, 3);
        assert!(stats.total_bytes > 0);
        assert!(stats.oldest.is_some() && stats.oldest <= stats.newest);
        let protected: Vec<_> = stats.symbols.iter().filter(|s| s.protected).collect();
        assert_eq!(protected.len(), 1);
        assert_eq!(protected[0].code, "399006");
    }

    #[test]
    fn clean_selects_old_unprotected_and_purge_removes() {
        let dir = tempdir().unwrap();
        let store = populated(dir.path());

        assert!(clean_older_than(&store, 30, SystemTime::now()).is_empty());

        let later = SystemTime::now() + Duration::from_secs(40 * 86_400);
        let old = clean_older_than(&store, 30, later);
        let codes: Vec<_> = old.iter().map(|f| f.name.code.as_str()).collect();
        assert_eq!(codes, vec!["000001", "000002"]);

        let report = purge(&store, &old);
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(
            store.cached_symbols().into_iter().collect::<Vec<_>>(),
            vec!["399006"]
        );
    }

    #[test]
    fn sizes_format() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
