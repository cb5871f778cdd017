//! Fetch executor: one symbol, incremental, retried.
//!
//! Decides whether a fetch is needed at all (up to date, or no trading days
//! in the pending range), retries the provider with exponential backoff,
//! normalizes and merges the result. Exhausted retries become a ledger entry
//! and a [`FetchOutcome::Failed`], never an `Err`.

use chrono::NaiveDate;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ledger::FailureLedger;
use crate::bar::Bar;
use crate::data::calendar::TradingCalendar;
use crate::data::normalize::normalize_rows;
use crate::data::pacing::{backoff_delay, Pacer};
use crate::data::provider::{DataError, DataProvider};
use crate::data::store::FragmentStore;
use crate::symbol::Symbol;

/// How many attempts a fetch gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt)
    }
}

/// Result of one executor call.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Stored data already reaches the requested end date.
    UpToDate(Vec<Bar>),
    /// The pending range holds no trading day.
    NoTradingDays(Vec<Bar>),
    /// The provider answered with no rows.
    NoNewData(Vec<Bar>),
    /// New rows were merged into the stored series.
    Fetched { series: Vec<Bar>, new_rows: usize },
    /// All attempts failed; the failure is in the ledger.
    Failed { error: DataError },
}

impl FetchOutcome {
    /// The symbol's series after this call. Empty for failures.
    pub fn rows(&self) -> &[Bar] {
        match self {
            FetchOutcome::UpToDate(rows)
            | FetchOutcome::NoTradingDays(rows)
            | FetchOutcome::NoNewData(rows) => rows.as_slice(),
            FetchOutcome::Fetched { series, .. } => series.as_slice(),
            FetchOutcome::Failed { .. } => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Bar> {
        match self {
            FetchOutcome::UpToDate(rows)
            | FetchOutcome::NoTradingDays(rows)
            | FetchOutcome::NoNewData(rows) => rows,
            FetchOutcome::Fetched { series, .. } => series,
            FetchOutcome::Failed { .. } => Vec::new(),
        }
    }

    /// Whether the data provider was called for this outcome.
    pub fn touched_provider(&self) -> bool {
        matches!(
            self,
            FetchOutcome::NoNewData(_) | FetchOutcome::Fetched { .. } | FetchOutcome::Failed { .. }
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed { .. })
    }
}

/// Incremental fetcher for a single symbol.
pub struct FetchExecutor<'a> {
    provider: &'a dyn DataProvider,
    store: &'a FragmentStore,
    calendar: &'a dyn TradingCalendar,
    ledger: &'a FailureLedger,
    pacer: &'a dyn Pacer,
    policy: RetryPolicy,
}

impl<'a> FetchExecutor<'a> {
    pub fn new(
        provider: &'a dyn DataProvider,
        store: &'a FragmentStore,
        calendar: &'a dyn TradingCalendar,
        ledger: &'a FailureLedger,
        pacer: &'a dyn Pacer,
    ) -> Self {
        Self {
            provider,
            store,
            calendar,
            ledger,
            pacer,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &'a FragmentStore {
        self.store
    }

    pub fn calendar(&self) -> &'a dyn TradingCalendar {
        self.calendar
    }

    pub fn ledger(&self) -> &'a FailureLedger {
        self.ledger
    }

    /// Bring `symbol` up to `end`, fetching from `start` when nothing is stored.
    ///
    /// `Err` means a local store fault while persisting fetched rows.
    pub fn fetch(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchOutcome, DataError> {
        let last = self.store.last_known_date(symbol);

        let pending_start = match last {
            Some(last) if last >= end => {
                debug!(symbol = %symbol, %last, "up to date");
                return Ok(FetchOutcome::UpToDate(self.store.load_with_fallback(symbol)));
            }
            Some(last) => {
                let from = last + chrono::Duration::days(1);
                if !self.calendar.has_trading_days(from, end) {
                    debug!(symbol = %symbol, %from, %end, "no trading days pending");
                    return Ok(FetchOutcome::NoTradingDays(
                        self.store.load_with_fallback(symbol),
                    ));
                }
                from
            }
            None => start,
        };

        let rows = match self.fetch_with_retry(symbol, pending_start, end) {
            Ok(rows) => rows,
            Err(error) => {
                warn!(symbol = %symbol, error = %error, "fetch failed after retries");
                if let Err(e) = self.ledger.record(symbol) {
                    warn!(symbol = %symbol, error = %e, "could not record failure");
                }
                return Ok(FetchOutcome::Failed { error });
            }
        };

        if rows.is_empty() {
            return Ok(FetchOutcome::NoNewData(self.store.load_with_fallback(symbol)));
        }

        let new_rows = rows.len();
        // A symbol known only from the canonical dataset is refragmented with its history.
        let incoming = if last.is_some() && self.store.fragment_path(symbol.code()).is_none() {
            let mut seeded = self.store.canonical_rows(symbol.code());
            seeded.extend(rows);
            seeded
        } else {
            rows
        };

        let series = self.store.merge(symbol, incoming)?;
        info!(symbol = %symbol, new_rows, total = series.len(), "fetched");
        Ok(FetchOutcome::Fetched { series, new_rows })
    }

    /// Call the provider until it answers or attempts run out.
    fn fetch_with_retry(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, DataError> {
        let attempts = self.policy.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let result = self
                .provider
                .fetch_daily_bars(symbol, start, end)
                .and_then(|rows| normalize_rows(symbol, rows));

            match result {
                Ok(bars) => return Ok(bars),
                Err(e) => {
                    warn!(symbol = %symbol, attempt = attempt + 1, attempts, error = %e, "fetch attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        self.pacer.pause(self.policy.delay_for(attempt));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("no fetch attempt made".into())))
    }
}
