//! Property-based tests for the merge rule, the fragment store and batch planning.
//!
//! - Merging is idempotent and never yields duplicate (symbol, date) keys
//! - Incoming rows win over stored rows on conflict
//! - Batch windows partition the universe in order

use chrono::NaiveDate;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use barvault_core::data::store::FragmentStore;
use barvault_core::pipeline::BatchPlan;
use barvault_core::{dedup_keep_last, resolve, Bar, ProtectedIndexes, Symbol};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_dir() -> std::path::PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("barvault_prop_{}_{}", std::process::id(), id))
}

// ── Strategies ───────────────────────────────────────────────────────

fn arb_bar() -> impl Strategy<Value = Bar> {
    (0usize..3, 0i64..40, 1.0f64..500.0).prop_map(|(sym, offset, close)| {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let symbol = ["000001", "000002", "600519"][sym];
        Bar::new(
            symbol,
            base + chrono::Duration::days(offset),
            close,
            close,
            close,
            close,
            1000.0,
        )
    })
}

fn arb_bars() -> impl Strategy<Value = Vec<Bar>> {
    prop::collection::vec(arb_bar(), 0..60)
}

fn keys(bars: &[Bar]) -> Vec<(String, NaiveDate)> {
    bars.iter().map(|b| (b.symbol.clone(), b.date)).collect()
}

proptest! {
    #[test]
    fn dedup_has_unique_sorted_keys(bars in arb_bars()) {
        let out = dedup_keep_last(bars.clone());
        let k = keys(&out);
        prop_assert!(k.windows(2).all(|w| w[0] < w[1]));

        let expected: BTreeSet<(String, NaiveDate)> = keys(&bars).into_iter().collect();
        prop_assert_eq!(k.len(), expected.len());
    }

    #[test]
    fn resolve_is_idempotent(existing in arb_bars(), incoming in arb_bars()) {
        let once = resolve(existing, incoming.clone());
        let twice = resolve(once.clone(), incoming);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn incoming_wins_on_conflict(existing in arb_bars(), incoming in arb_bars()) {
        let merged = resolve(existing, incoming.clone());
        for bar in dedup_keep_last(incoming) {
            let found = merged
                .iter()
                .find(|m| m.symbol == bar.symbol && m.date == bar.date);
            prop_assert_eq!(found, Some(&bar));
        }
    }

    #[test]
    fn store_merge_twice_equals_once(incoming in prop::collection::vec(arb_bar(), 1..30)) {
        let dir = unique_dir();
        let store = FragmentStore::new(
            dir.join("price_cache"),
            dir.join("prices.csv"),
            ProtectedIndexes::default(),
        );
        let rows: Vec<Bar> = incoming
            .into_iter()
            .map(|mut b| { b.symbol = "000001".into(); b })
            .collect();
        let sym = Symbol::stock("000001");

        let once = store.merge(&sym, rows.clone()).unwrap();
        let twice = store.merge(&sym, rows).unwrap();
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(store.fragments().len(), 1);
        prop_assert_eq!(store.load(&sym), once);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn batch_windows_partition_universe(len in 0usize..500, batch_size in 1usize..80) {
        let plan = BatchPlan::new(len, batch_size, None);
        prop_assert!(plan.total_batches >= 1);
        prop_assert!(plan.capacity() >= len);

        let mut next = 0usize;
        for b in 1..=plan.total_batches {
            let window = plan.window(b, len);
            prop_assert_eq!(window.start, next.min(len));
            prop_assert!(window.len() <= batch_size);
            next = window.end;
        }
        prop_assert_eq!(next, len);
    }

    #[test]
    fn explicit_batch_count_caps_coverage(len in 1usize..300, batch_size in 1usize..50, total in 1usize..10) {
        let plan = BatchPlan::new(len, batch_size, Some(total));
        prop_assert_eq!(plan.total_batches, total);
        let covered: usize = (1..=total).map(|b| plan.window(b, len).len()).sum();
        prop_assert_eq!(covered, len.min(total * batch_size));
    }
}
