//! Batch scheduler.
//!
//! The ordered universe is cut into fixed-size windows. Each batch is gated
//! as a whole first (one calendar probe for the leading symbol), then every
//! symbol goes through the fetch executor in window order, paced by a fixed
//! inter-request delay. A symbol's fault never aborts its batch.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::executor::{FetchExecutor, FetchOutcome};
use crate::bar::{dedup_keep_last, Bar};
use crate::data::pacing::Pacer;
use crate::data::table::{remove_if_exists, write_bars};
use crate::symbol::Symbol;

/// How the universe is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub total_batches: usize,
}

impl BatchPlan {
    /// Plan for `universe_len` symbols. Without an explicit batch count the
    /// universe is covered exactly: `ceil(len / batch_size)`, at least one.
    pub fn new(universe_len: usize, batch_size: usize, total_batches: Option<usize>) -> Self {
        let batch_size = batch_size.max(1);
        let total_batches = total_batches
            .unwrap_or_else(|| universe_len.div_ceil(batch_size))
            .max(1);
        Self {
            batch_size,
            total_batches,
        }
    }

    /// Index range of batch `batch` (1-based) in a universe of `len` symbols.
    pub fn window(&self, batch: usize, len: usize) -> Range<usize> {
        let start = batch.saturating_sub(1).saturating_mul(self.batch_size).min(len);
        let end = batch.saturating_mul(self.batch_size).min(len);
        start..end
    }

    /// Symbols the plan can reach.
    pub fn capacity(&self) -> usize {
        self.batch_size.saturating_mul(self.total_batches)
    }
}

/// Per-batch counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub batch: usize,
    pub failed_stocks: Vec<String>,
    pub valid_stocks: usize,
    pub skipped_stocks: usize,
    pub total_stocks: usize,
    pub new_records: usize,
    pub up_to_date_stocks: usize,
}

/// What happened to one symbol inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    UpToDate,
    NoTradingDays,
    NoNewData,
    Valid { rows: usize, new_rows: usize },
    InsufficientHistory { rows: usize },
    Failed(String),
}

/// Observer for batch progress.
pub trait BatchProgress {
    fn on_symbol(&self, batch: usize, position: usize, window_len: usize, symbol: &Symbol, outcome: &SymbolOutcome);

    fn on_batch_complete(&self, stats: &BatchStats);
}

/// Progress reporter that writes to the tracing log.
pub struct LogProgress;

impl BatchProgress for LogProgress {
    fn on_symbol(&self, batch: usize, position: usize, window_len: usize, symbol: &Symbol, outcome: &SymbolOutcome) {
        match outcome {
            SymbolOutcome::Failed(reason) => {
                warn!(batch, "[{}/{}] {symbol} failed: {reason}", position + 1, window_len)
            }
            other => info!(batch, "[{}/{}] {symbol}: {other:?}", position + 1, window_len),
        }
    }

    fn on_batch_complete(&self, stats: &BatchStats) {
        info!(
            batch = stats.batch,
            valid = stats.valid_stocks,
            skipped = stats.skipped_stocks,
            up_to_date = stats.up_to_date_stocks,
            failed = stats.failed_stocks.len(),
            new_records = stats.new_records,
            "batch complete"
        );
    }
}

/// Settings that stay fixed for a whole run.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub request_delay: Duration,
    pub min_history_days: usize,
}

/// Batch number of the fragment holding retried ledger symbols.
pub const RETRY_BATCH: usize = 0;

/// Path of the intermediate fragment for batch `batch`.
pub fn batch_fragment_path(data_dir: &Path, batch: usize) -> PathBuf {
    data_dir.join(format!("prices_batch_{batch}.csv"))
}

/// Runs one batch at a time over a fixed universe.
pub struct BatchScheduler<'a> {
    executor: &'a FetchExecutor<'a>,
    pacer: &'a dyn Pacer,
    progress: &'a dyn BatchProgress,
    settings: SchedulerSettings,
    data_dir: PathBuf,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(
        executor: &'a FetchExecutor<'a>,
        pacer: &'a dyn Pacer,
        progress: &'a dyn BatchProgress,
        settings: SchedulerSettings,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            pacer,
            progress,
            settings,
            data_dir: data_dir.into(),
        }
    }

    /// Process batch `batch` of `plan` over `universe`.
    ///
    /// A batch that writes no rows also removes any `prices_batch_{batch}.csv`
    /// left behind by an earlier run.
    pub fn run_batch(&self, batch: usize, universe: &[Symbol], plan: &BatchPlan) -> BatchStats {
        let window = &universe[plan.window(batch, universe.len())];

        if let Some(first) = window.first() {
            if self.batch_is_current(first) {
                info!(batch, symbols = window.len(), "batch already current, skipping");
                let stats = BatchStats {
                    batch,
                    total_stocks: window.len(),
                    skipped_stocks: window.len(),
                    up_to_date_stocks: window.len(),
                    ..BatchStats::default()
                };
                self.discard_fragment(batch);
                self.progress.on_batch_complete(&stats);
                return stats;
            }
            info!(batch, total_batches = plan.total_batches, symbols = window.len(), "starting batch");
        }

        self.process_window(batch, window)
    }

    /// Fetch symbols that sit outside the remaining batch windows, such as
    /// ledgered failures from windows a resumed run has already passed.
    ///
    /// No batch gate. Rows go to the [`RETRY_BATCH`] fragment.
    pub fn run_retry(&self, symbols: &[Symbol]) -> BatchStats {
        info!(symbols = symbols.len(), "retrying ledgered symbols");
        self.process_window(RETRY_BATCH, symbols)
    }

    fn process_window(&self, batch: usize, window: &[Symbol]) -> BatchStats {
        let mut stats = BatchStats {
            batch,
            total_stocks: window.len(),
            ..BatchStats::default()
        };
        let mut accumulated: Vec<Bar> = Vec::new();

        for (position, symbol) in window.iter().enumerate() {
            let (outcome, touched) = self.process_symbol(symbol, &mut stats, &mut accumulated);
            self.progress
                .on_symbol(batch, position, window.len(), symbol, &outcome);

            if touched && position + 1 < window.len() {
                self.pacer.pause(self.settings.request_delay);
            }
        }

        if accumulated.is_empty() {
            if !window.is_empty() {
                warn!(batch, "batch produced no rows");
            }
            self.discard_fragment(batch);
        } else {
            let rows = dedup_keep_last(accumulated);
            let path = batch_fragment_path(&self.data_dir, batch);
            match write_bars(&path, &rows) {
                Ok(()) => info!(batch, rows = rows.len(), path = %path.display(), "batch fragment written"),
                Err(e) => {
                    warn!(batch, error = %e, "failed to write batch fragment");
                    self.discard_fragment(batch);
                }
            }
        }

        self.progress.on_batch_complete(&stats);
        stats
    }

    /// Remove a batch fragment this run did not write.
    fn discard_fragment(&self, batch: usize) {
        let path = batch_fragment_path(&self.data_dir, batch);
        match remove_if_exists(&path) {
            Ok(true) => info!(batch, path = %path.display(), "removed stale batch fragment"),
            Ok(false) => {}
            Err(e) => warn!(batch, path = %path.display(), error = %e, "failed to remove stale batch fragment"),
        }
    }

    /// One calendar probe for the window's leading symbol.
    fn batch_is_current(&self, first: &Symbol) -> bool {
        let store = self.executor.store();
        let Some(last) = store.last_known_date(first) else {
            return false;
        };
        let from = last + chrono::Duration::days(1);
        !self.executor.calendar().has_trading_days(from, self.settings.end)
    }

    fn process_symbol(
        &self,
        symbol: &Symbol,
        stats: &mut BatchStats,
        accumulated: &mut Vec<Bar>,
    ) -> (SymbolOutcome, bool) {
        let result = self
            .executor
            .fetch(symbol, self.settings.start, self.settings.end);
        let touched = result.as_ref().map_or(true, FetchOutcome::touched_provider);

        let outcome = match result {
            Ok(FetchOutcome::UpToDate(_)) => {
                stats.skipped_stocks += 1;
                stats.up_to_date_stocks += 1;
                SymbolOutcome::UpToDate
            }
            Ok(FetchOutcome::NoTradingDays(_)) => {
                stats.skipped_stocks += 1;
                SymbolOutcome::NoTradingDays
            }
            Ok(FetchOutcome::NoNewData(_)) => {
                stats.skipped_stocks += 1;
                SymbolOutcome::NoNewData
            }
            Ok(FetchOutcome::Fetched { series, new_rows }) => {
                stats.new_records += new_rows;
                if series.len() < self.settings.min_history_days {
                    self.record_failure(symbol, stats);
                    SymbolOutcome::InsufficientHistory { rows: series.len() }
                } else {
                    stats.valid_stocks += 1;
                    let rows = series.len();
                    accumulated.extend(series);
                    SymbolOutcome::Valid { rows, new_rows }
                }
            }
            Ok(FetchOutcome::Failed { error }) => {
                stats.failed_stocks.push(symbol.code().to_string());
                SymbolOutcome::Failed(error.to_string())
            }
            Err(error) => {
                self.record_failure(symbol, stats);
                SymbolOutcome::Failed(error.to_string())
            }
        };
        (outcome, touched)
    }

    /// Count a failure the executor did not already ledger.
    fn record_failure(&self, symbol: &Symbol, stats: &mut BatchStats) {
        stats.failed_stocks.push(symbol.code().to_string());
        if let Err(e) = self.executor.ledger().record(symbol) {
            warn!(symbol = %symbol, error = %e, "could not record failure");
        }
    }
}
