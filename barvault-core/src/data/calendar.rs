//! Trading calendar gate.
//!
//! Answers "does this date range contain any trading activity" by probing a
//! liquid reference symbol. The gate fails open: when the probe errors the
//! answer is `true`, trading one wasted request for never skipping real data.

use chrono::NaiveDate;
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::provider::DataProvider;
use crate::symbol::Symbol;

pub trait TradingCalendar {
    /// `false` only when `[start, end]` is known to contain no trading day.
    fn has_trading_days(&self, start: NaiveDate, end: NaiveDate) -> bool;
}

/// Calendar backed by a provider probe of a reference symbol.
///
/// Answers from successful probes are memoized for the lifetime of the
/// instance, which is one acquisition run. Failed probes are not memoized.
pub struct ProbeCalendar<'a> {
    provider: &'a dyn DataProvider,
    reference: Symbol,
    memo: RefCell<HashMap<(NaiveDate, NaiveDate), bool>>,
}

impl<'a> ProbeCalendar<'a> {
    pub fn new(provider: &'a dyn DataProvider, reference: Symbol) -> Self {
        Self {
            provider,
            reference,
            memo: RefCell::new(HashMap::new()),
        }
    }

    pub fn reference(&self) -> &Symbol {
        &self.reference
    }
}

impl TradingCalendar for ProbeCalendar<'_> {
    fn has_trading_days(&self, start: NaiveDate, end: NaiveDate) -> bool {
        if start > end {
            return false;
        }

        if let Some(&known) = self.memo.borrow().get(&(start, end)) {
            return known;
        }

        match self.provider.fetch_daily_bars(&self.reference, start, end) {
            Ok(rows) => {
                let open = !rows.is_empty();
                debug!(%start, %end, open, "calendar probe");
                self.memo.borrow_mut().insert((start, end), open);
                open
            }
            Err(e) => {
                warn!(%start, %end, error = %e, "calendar probe failed, assuming trading days");
                true
            }
        }
    }
}
