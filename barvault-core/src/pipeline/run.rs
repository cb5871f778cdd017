//! Acquisition run: fresh or resumed, from universe to canonical dataset.
//!
//! Order of work:
//! 1. Build the universe (fresh: constituent snapshots; resume: pending queue
//!    plus failed stocks).
//! 2. Fetch every protected index.
//! 3. On a resume past batch 1, retry the ledgered stocks whose windows are
//!    already behind the saved position.
//! 4. Run the stock batches from the saved position, persisting the batch
//!    state around each one.
//! 5. Consolidate, evict stale fragments, settle the ledger and pending
//!    queue, write the download log.

use chrono::{Local, NaiveDateTime};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::{error, info, warn};

use super::consolidate::{
    remove_batch_fragments, retain_set, Cleanup, ConsolidationReport, Consolidator,
};
use super::executor::{FetchExecutor, FetchOutcome};
use super::ledger::{FailureLedger, PendingQueue};
use super::scheduler::{BatchPlan, BatchProgress, BatchScheduler, BatchStats, SchedulerSettings};
use super::state::{BatchState, BatchStateFile, DownloadLog};
use crate::config::{ArchiveConfig, ArchiveLayout};
use crate::data::calendar::TradingCalendar;
use crate::data::constituents::ConstituentCache;
use crate::data::pacing::Pacer;
use crate::data::provider::{DataError, DataProvider};
use crate::data::store::FragmentStore;
use crate::data::table::write_atomic;
use crate::symbol::{Symbol, SymbolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Fresh,
    Resume,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Fresh => f.write_str("fresh"),
            RunMode::Resume => f.write_str("resume"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every symbol and index succeeded.
    Success,
    /// The dataset was written but some symbols failed.
    Partial,
    /// Nothing could be consolidated.
    Failed,
}

/// Counters summed over the batches of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub batches_run: usize,
    pub stocks_processed: usize,
    pub valid_stocks: usize,
    pub skipped_stocks: usize,
    pub up_to_date_stocks: usize,
    pub new_records: usize,
    /// Ledgered stocks retried outside the batch windows.
    pub retried_stocks: usize,
}

impl RunTotals {
    fn absorb(&mut self, stats: &BatchStats) {
        self.batches_run += 1;
        self.add_counts(stats);
    }

    fn absorb_retry(&mut self, stats: &BatchStats) {
        self.retried_stocks += stats.total_stocks;
        self.add_counts(stats);
    }

    fn add_counts(&mut self, stats: &BatchStats) {
        self.stocks_processed += stats.total_stocks;
        self.valid_stocks += stats.valid_stocks;
        self.skipped_stocks += stats.skipped_stocks;
        self.up_to_date_stocks += stats.up_to_date_stocks;
        self.new_records += stats.new_records;
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: RunMode,
    pub status: RunStatus,
    pub universe_size: usize,
    pub total_batches: usize,
    pub totals: RunTotals,
    pub failed_stocks: Vec<String>,
    pub failed_indexes: Vec<String>,
    pub evicted: Vec<String>,
    pub consolidation: Option<ConsolidationReport>,
}

/// Collaborators that live outside the archive directory.
pub struct RunContext<'a> {
    pub provider: &'a dyn DataProvider,
    pub calendar: &'a dyn TradingCalendar,
    pub constituents: &'a ConstituentCache<'a>,
    pub pacer: &'a dyn Pacer,
    pub progress: &'a dyn BatchProgress,
}

/// One acquisition run over the archive described by `config`.
pub struct AcquisitionRun<'a> {
    config: &'a ArchiveConfig,
    ctx: RunContext<'a>,
    layout: ArchiveLayout,
}

impl<'a> AcquisitionRun<'a> {
    pub fn new(config: &'a ArchiveConfig, ctx: RunContext<'a>) -> Self {
        Self {
            config,
            ctx,
            layout: config.layout(),
        }
    }

    pub fn execute(&self, mode: RunMode) -> Result<RunReport, DataError> {
        let started = Local::now().naive_local();
        let download = &self.config.download;
        let start = download.start_date;
        let end = self.config.end_date();

        if let Some(previous) = DownloadLog::load(&self.layout.download_log_path()) {
            info!(
                finished = %previous.download_end_time,
                processed = previous.total_stocks_processed,
                failed = previous.failed_stocks_count,
                "previous run"
            );
        }

        let protected = self.config.protected_indexes();
        let index_symbols = protected.symbols();
        let store = FragmentStore::new(
            self.layout.price_cache_dir(),
            self.layout.canonical_path(),
            protected,
        );
        let width = download.symbol_width;
        let ledger = FailureLedger::new(
            self.layout.failed_indexes_path(),
            self.layout.failed_stocks_path(),
        )
        .with_width(width);
        let pending = PendingQueue::new(self.layout.pending_path()).with_width(width);
        let state_file = BatchStateFile::new(self.layout.batch_state_path());

        let (base, saved_state, ledgered) = match mode {
            RunMode::Fresh => {
                ledger.clear()?;
                state_file.clear()?;
                pending.clear()?;
                let stale = remove_batch_fragments(&self.layout.data_dir);
                if stale > 0 {
                    info!(removed = stale, "removed batch fragments of an abandoned run");
                }
                let codes = self.constituent_universe(&index_symbols, download.refresh_constituents);
                pending.save(&codes)?;
                (codes, None, Vec::new())
            }
            RunMode::Resume => {
                let saved = state_file.load();
                let base = match pending.load() {
                    Some(queue) => {
                        info!(pending = queue.len(), "resuming from pending queue");
                        queue
                    }
                    None => self.constituent_universe(&index_symbols, false),
                };
                (dedup_first(base), saved, ledger.failed_stocks())
            }
        };

        let capped = |n: usize| match download.max_symbols {
            0 => n,
            limit => n.min(limit),
        };
        let mut plan = BatchPlan::new(capped(base.len()), download.batch_size, download.total_batches);
        let mut state = match mode {
            RunMode::Fresh => BatchState::fresh(plan.total_batches),
            RunMode::Resume => BatchState::resume_from(saved_state, plan.total_batches),
        };

        // Past batch 1 the queue order must match the saved windows.
        let codes = if state.current_batch > 1 {
            base
        } else {
            if !ledgered.is_empty() {
                info!(count = ledgered.len(), "retrying previously failed stocks first");
            }
            let codes = dedup_first(ledgered.iter().cloned().chain(base).collect());
            plan = BatchPlan::new(capped(codes.len()), download.batch_size, download.total_batches);
            state = BatchState::fresh(plan.total_batches);
            codes
        };

        let full_universe: Vec<Symbol> = codes
            .iter()
            .map(|c| Symbol::new(c, SymbolKind::Stock, width))
            .collect();
        let mut universe = full_universe.clone();
        if universe.len() > capped(universe.len()) {
            info!(limit = download.max_symbols, available = universe.len(), "truncating universe");
            universe.truncate(download.max_symbols);
        }

        if universe.len() > plan.capacity() {
            warn!(
                unreachable = universe.len() - plan.capacity(),
                total_batches = plan.total_batches,
                batch_size = plan.batch_size,
                "universe exceeds batch plan, trailing symbols will not be fetched"
            );
        }

        // Ledgered stocks the remaining windows will not reach.
        let done = state.current_batch.saturating_sub(1).saturating_mul(plan.batch_size);
        let ahead: HashSet<&str> = universe.iter().skip(done).map(Symbol::code).collect();
        let retry: Vec<Symbol> = ledgered
            .iter()
            .filter(|c| !ahead.contains(c.as_str()))
            .map(|c| Symbol::new(c, SymbolKind::Stock, width))
            .collect();

        info!(
            %mode,
            symbols = universe.len(),
            total_batches = plan.total_batches,
            start_batch = state.current_batch,
            retry = retry.len(),
            %start,
            %end,
            "acquisition run starting"
        );

        let executor = FetchExecutor::new(
            self.ctx.provider,
            &store,
            self.ctx.calendar,
            &ledger,
            self.ctx.pacer,
        )
        .with_policy(self.config.retry_policy());

        let (failed_indexes, index_records) =
            self.fetch_indexes(&executor, &index_symbols, &ledger, start, end);

        let scheduler = BatchScheduler::new(
            &executor,
            self.ctx.pacer,
            self.ctx.progress,
            SchedulerSettings {
                start,
                end,
                request_delay: self.config.request_delay(),
                min_history_days: download.min_history_days,
            },
            &self.layout.data_dir,
        );

        let mut totals = RunTotals {
            new_records: index_records,
            ..RunTotals::default()
        };
        let mut failed_stocks: Vec<String> = Vec::new();

        if !retry.is_empty() {
            let stats = scheduler.run_retry(&retry);
            totals.absorb_retry(&stats);
            failed_stocks.extend(stats.failed_stocks.iter().cloned());
            if !state.is_finished() {
                self.ctx.pacer.pause(self.config.request_delay());
            }
        }

        while !state.is_finished() {
            let batch = state.current_batch;
            state_file.save(&BatchState {
                current_batch: batch,
                total_batches: plan.total_batches,
                completed_batches: batch - 1,
            })?;

            let stats = scheduler.run_batch(batch, &universe, &plan);
            totals.absorb(&stats);
            failed_stocks.extend(stats.failed_stocks.iter().cloned());

            state = state.advance();
            state_file.save(&state)?;

            if batch < plan.total_batches {
                info!(seconds = self.config.batch_wait().as_secs(), "waiting before next batch");
                self.ctx.pacer.pause(self.config.batch_wait());
            }
        }
        state_file.clear()?;
        let failed_stocks = dedup_first(failed_stocks);

        let union = self.ctx.constituents.cached_union(&index_symbols);
        let mut retain = retain_set(&full_universe, &store);
        retain.extend(union.iter().cloned());
        retain.extend(retry.iter().map(|s| s.code().to_string()));

        let consolidation = match Consolidator::new(&store, &self.layout.data_dir)
            .consolidate(plan.total_batches, Some(&retain))
        {
            Ok(report) => Some(report),
            Err(DataError::NothingToConsolidate) => {
                error!("no data could be consolidated");
                None
            }
            Err(e) => return Err(e),
        };

        let evicted = Cleanup::new(&store).evict_stale(&union);

        let status = match &consolidation {
            None => RunStatus::Failed,
            Some(_) if failed_stocks.is_empty() && failed_indexes.is_empty() => RunStatus::Success,
            Some(_) => RunStatus::Partial,
        };

        match status {
            RunStatus::Success => {
                ledger.clear()?;
                pending.clear()?;
                self.write_universe_list(&union, &codes)?;
            }
            RunStatus::Partial => {
                pending.save(&failed_stocks)?;
                if !failed_stocks.is_empty() {
                    warn!(count = failed_stocks.len(), "failed stocks kept for the next resume");
                }
            }
            // pending queue stays as it was so a resume retries the whole universe
            RunStatus::Failed => {}
        }

        if let Some(report) = &consolidation {
            let log = DownloadLog {
                download_start_time: started,
                download_end_time: now(),
                total_batches: plan.total_batches,
                total_stocks_processed: totals.stocks_processed,
                total_valid_stocks: totals.valid_stocks,
                total_skipped_stocks: totals.skipped_stocks,
                total_up_to_date_stocks: totals.up_to_date_stocks,
                total_new_records: totals.new_records,
                failed_stocks_count: failed_stocks.len(),
                failed_indexes_count: failed_indexes.len(),
                dataset_rows: report.rows,
                dataset_hash: Some(report.content_hash.clone()),
            };
            log.save(&self.layout.download_log_path())?;
        }

        info!(
            ?status,
            batches = totals.batches_run,
            valid = totals.valid_stocks,
            skipped = totals.skipped_stocks,
            new_records = totals.new_records,
            failed_stocks = failed_stocks.len(),
            failed_indexes = failed_indexes.len(),
            evicted = evicted.len(),
            "acquisition run finished"
        );

        Ok(RunReport {
            mode,
            status,
            universe_size: universe.len(),
            total_batches: plan.total_batches,
            totals,
            failed_stocks,
            failed_indexes,
            evicted,
            consolidation,
        })
    }

    fn constituent_universe(&self, indexes: &[Symbol], refresh: bool) -> Vec<String> {
        let (members, missing) = self.ctx.constituents.universe(indexes, refresh);
        for (index, e) in &missing {
            warn!(index = %index, error = %e, "no constituents for index");
        }
        info!(indexes = indexes.len(), members = members.len(), "universe resolved");
        members
    }

    /// Fetch every protected index, previously failed ones first.
    ///
    /// Returns the codes that failed in this run and the number of new rows.
    fn fetch_indexes(
        &self,
        executor: &FetchExecutor<'_>,
        protected: &[Symbol],
        ledger: &FailureLedger,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    ) -> (Vec<String>, usize) {
        let width = self.config.download.symbol_width;
        let mut ordered: Vec<Symbol> = ledger
            .failed_indexes()
            .iter()
            .map(|c| Symbol::new(c, SymbolKind::Index, width))
            .collect();
        ordered.extend(protected.iter().cloned());
        let mut seen = HashSet::new();
        ordered.retain(|s| seen.insert(s.code().to_string()));

        let mut failed = Vec::new();
        let mut new_records = 0;
        for (position, index) in ordered.iter().enumerate() {
            let touched = match executor.fetch(index, start, end) {
                Ok(FetchOutcome::Fetched { new_rows, .. }) => {
                    new_records += new_rows;
                    true
                }
                Ok(outcome) => {
                    if outcome.is_failed() {
                        failed.push(index.code().to_string());
                    }
                    outcome.touched_provider()
                }
                Err(e) => {
                    warn!(index = %index, error = %e, "index fetch could not be stored");
                    if let Err(e) = ledger.record(index) {
                        warn!(index = %index, error = %e, "could not record failure");
                    }
                    failed.push(index.code().to_string());
                    true
                }
            };
            if touched && position + 1 < ordered.len() {
                self.ctx.pacer.pause(self.config.request_delay());
            }
        }

        info!(indexes = ordered.len(), failed = failed.len(), "index phase complete");
        (failed, new_records)
    }

    /// `constituents.csv`: the snapshot union, or the run's universe when
    /// no snapshot is cached.
    fn write_universe_list(&self, union: &BTreeSet<String>, codes: &[String]) -> Result<(), DataError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let write_err = |e: csv::Error| DataError::CacheError(format!("csv encode: {e}"));
        writer.write_record(["symbol"]).map_err(write_err)?;
        if union.is_empty() {
            for code in codes {
                writer.write_record([code.as_str()]).map_err(write_err)?;
            }
        } else {
            for code in union {
                writer.write_record([code.as_str()]).map_err(write_err)?;
            }
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| DataError::CacheError(format!("csv flush: {e}")))?;
        write_atomic(&self.layout.universe_path(), &bytes)
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Drop repeated codes, keeping the first occurrence.
fn dedup_first(codes: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    codes.into_iter().filter(|c| seen.insert(c.clone())).collect()
}
