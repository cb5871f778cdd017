//! barvault CLI: acquisition runs, consolidation, queries and cache management.
//!
//! Commands:
//! - `fetch` / `resume`: fresh or resumed acquisition run
//! - `consolidate`: rebuild prices.csv from the fragments on disk
//! - `query`: read bars from the archive
//! - `status`: batch position, pending queue, ledger and last run
//! - `integrity`: cross-check snapshots, fragments and the dataset
//! - `cache status|clean|evict`: inspect and prune the fragment cache

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

use barvault_core::data::{
    ConstituentCache, ConstituentSource, FragmentStore, ManifestSource, ProbeCalendar,
    ThreadPacer, YahooProvider,
};
use barvault_core::integrity::IntegrityReport;
use barvault_core::maintenance::{cache_stats, clean_older_than, format_size, purge};
use barvault_core::pipeline::consolidate::highest_batch_fragment;
use barvault_core::pipeline::{
    AcquisitionRun, BatchStateFile, Consolidator, DownloadLog, FailureLedger, LogProgress,
    PendingQueue, RunContext, RunMode, RunReport, RunStatus,
};
use barvault_core::query::ArchiveReader;
use barvault_core::{normalize_code, ArchiveConfig};

#[derive(Parser)]
#[command(
    name = "barvault",
    about = "barvault: resumable daily-bar archive"
)]
struct Cli {
    /// Configuration file. Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "barvault.toml")]
    config: PathBuf,

    /// Data directory (overrides the config file).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Start date (YYYY-MM-DD).
    #[arg(long)]
    start: Option<String>,

    /// End date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    end: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    total_batches: Option<usize>,

    /// Limit the universe to this many symbols (0 = no limit).
    #[arg(long)]
    max_symbols: Option<usize>,

    #[arg(long)]
    request_delay_ms: Option<u64>,

    #[arg(long)]
    batch_wait_secs: Option<u64>,

    /// Refresh constituent snapshots from the source.
    #[arg(long, default_value_t = false)]
    refresh_constituents: bool,

    /// TOML manifest of index constituents used as the constituent source.
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh acquisition run.
    Fetch(RunArgs),
    /// Continue from the saved batch position and pending queue.
    Resume(RunArgs),
    /// Rebuild prices.csv from the dataset and batch fragments on disk.
    Consolidate,
    /// Print bars for the given symbols (all when none given).
    Query {
        symbols: Vec<String>,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Emit JSON instead of CSV.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show batch state, pending queue, ledger sizes and the last run.
    Status,
    /// Cross-check constituent snapshots, fragments and the dataset.
    Integrity {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Fragment cache commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report fragment count, size and per-symbol coverage.
    Status,
    /// Remove fragments not written within the given number of days.
    Clean {
        #[arg(long)]
        older_than_days: u64,

        /// Actually delete (without this flag, only previews what would be removed).
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
    /// Remove every fragment of the given symbols. Protected indexes are refused.
    Evict {
        #[arg(required = true)]
        symbols: Vec<String>,

        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ArchiveConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = cli.data_dir {
        config.paths.data_dir = dir;
    }
    init_logging(&config.layout().log_dir());

    match cli.command {
        Commands::Fetch(args) => run_acquisition(config, args, RunMode::Fresh),
        Commands::Resume(args) => run_acquisition(config, args, RunMode::Resume),
        Commands::Consolidate => run_consolidate(&config),
        Commands::Query {
            symbols,
            start,
            end,
            json,
        } => run_query(&config, &symbols, &start, &end, json),
        Commands::Status => run_status(&config),
        Commands::Integrity { json } => run_integrity(&config, json),
        Commands::Cache { action } => match action {
            CacheAction::Status => run_cache_status(&config),
            CacheAction::Clean {
                older_than_days,
                confirm,
            } => run_cache_clean(&config, older_than_days, confirm),
            CacheAction::Evict { symbols, confirm } => run_cache_evict(&config, &symbols, confirm),
        },
    }
}

/// Console plus a daily-rolling file under `{data_dir}/logs` when writable.
fn init_logging(log_dir: &Path) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,barvault_core=info"));

    // rolling::daily panics if it cannot create the file, so check first
    let file_layer = if std::fs::create_dir_all(log_dir).is_ok() {
        let test_path = log_dir.join(".barvault_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(log_dir, "barvault.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not write to log directory {} ({e}), file logging disabled",
                    log_dir.display()
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: could not create log directory {}, file logging disabled",
            log_dir.display()
        );
        None
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{text}', expected YYYY-MM-DD"))
}

fn apply_overrides(config: &mut ArchiveConfig, args: &RunArgs) -> Result<()> {
    let d = &mut config.download;
    if let Some(start) = &args.start {
        d.start_date = parse_date(start)?;
    }
    if let Some(end) = &args.end {
        d.end_date = Some(parse_date(end)?);
    }
    if let Some(n) = args.batch_size {
        d.batch_size = n;
    }
    if let Some(n) = args.total_batches {
        d.total_batches = Some(n);
    }
    if let Some(n) = args.max_symbols {
        d.max_symbols = n;
    }
    if let Some(ms) = args.request_delay_ms {
        d.request_delay_ms = ms;
    }
    if let Some(secs) = args.batch_wait_secs {
        d.batch_wait_secs = secs;
    }
    if args.refresh_constituents {
        d.refresh_constituents = true;
    }
    config.validate()?;
    Ok(())
}

fn run_acquisition(mut config: ArchiveConfig, args: RunArgs, mode: RunMode) -> Result<()> {
    apply_overrides(&mut config, &args)?;
    let layout = config.layout();

    let provider = YahooProvider::new()?;
    let pacer = ThreadPacer;
    let calendar = ProbeCalendar::new(&provider, config.reference_symbol());
    let manifest = match &args.manifest {
        Some(path) => Some(ManifestSource::from_file(path)?),
        None => None,
    };

    let mut constituents = ConstituentCache::new(layout.constituents_dir(), &pacer)
        .with_retry(config.download.max_retries, config.retry_policy().base_delay)
        .with_width(config.download.symbol_width);
    if let Some(source) = &manifest {
        constituents = constituents.with_source(source as &dyn ConstituentSource);
    }

    info!(provider = "yahoo", data_dir = %layout.data_dir.display(), %mode, "starting");
    let run = AcquisitionRun::new(
        &config,
        RunContext {
            provider: &provider,
            calendar: &calendar,
            constituents: &constituents,
            pacer: &pacer,
            progress: &LogProgress,
        },
    );
    let report = run.execute(mode)?;
    print_report(&report);

    match report.status {
        RunStatus::Success => Ok(()),
        RunStatus::Partial => bail!(
            "run finished with {} failed stocks and {} failed indexes; `barvault resume` retries them",
            report.failed_stocks.len(),
            report.failed_indexes.len()
        ),
        RunStatus::Failed => bail!("run failed: nothing could be consolidated"),
    }
}

fn print_report(report: &RunReport) {
    let t = &report.totals;
    println!();
    println!("=== Acquisition Run ({}) ===", report.mode);
    println!("Status:          {:?}", report.status);
    println!("Universe:        {} symbols", report.universe_size);
    println!("Batches:         {} of {}", t.batches_run, report.total_batches);
    println!("Processed:       {}", t.stocks_processed);
    if t.retried_stocks > 0 {
        println!("Retried:         {} (ledgered from earlier batches)", t.retried_stocks);
    }
    println!("Valid:           {}", t.valid_stocks);
    println!("Skipped:         {} ({} up to date)", t.skipped_stocks, t.up_to_date_stocks);
    println!("New records:     {}", t.new_records);
    println!("Evicted:         {}", report.evicted.len());
    if let Some(c) = &report.consolidation {
        println!("Dataset:         {} rows, {} symbols", c.rows, c.symbols);
        println!("Dataset hash:    {}", c.content_hash);
    }
    if !report.failed_indexes.is_empty() {
        println!("Failed indexes:  {}", report.failed_indexes.join(", "));
    }
    if !report.failed_stocks.is_empty() {
        let shown: Vec<&str> = report.failed_stocks.iter().take(20).map(String::as_str).collect();
        let more = report.failed_stocks.len().saturating_sub(shown.len());
        if more > 0 {
            println!("Failed stocks:   {} (+{more} more)", shown.join(", "));
        } else {
            println!("Failed stocks:   {}", shown.join(", "));
        }
    }
}

fn open_store(config: &ArchiveConfig) -> FragmentStore {
    let layout = config.layout();
    FragmentStore::new(
        layout.price_cache_dir(),
        layout.canonical_path(),
        config.protected_indexes(),
    )
}

fn run_consolidate(config: &ArchiveConfig) -> Result<()> {
    let layout = config.layout();
    let store = open_store(config);
    let batches = highest_batch_fragment(&layout.data_dir);
    let report = Consolidator::new(&store, &layout.data_dir).consolidate(batches, None)?;
    println!(
        "Wrote {}: {} rows, {} symbols ({} inputs, {} skipped)",
        layout.canonical_path().display(),
        report.rows,
        report.symbols,
        report.fragments_loaded,
        report.fragments_skipped
    );
    println!("Hash: {}", report.content_hash);
    Ok(())
}

fn run_query(config: &ArchiveConfig, symbols: &[String], start: &str, end: &str, json: bool) -> Result<()> {
    let (start, end) = (parse_date(start)?, parse_date(end)?);
    if start > end {
        bail!("start {start} is after end {end}");
    }
    let result = ArchiveReader::from_config(config).query(symbols, start, end)?;
    if result.widened {
        eprintln!(
            "No data in {start}..{end}; showing nearest window {}..{}",
            result.effective_start, result.effective_end
        );
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result.rows)?);
    } else {
        println!("date,symbol,open,high,low,close,volume");
        for b in &result.rows {
            println!(
                "{},{},{},{},{},{},{}",
                b.date, b.symbol, b.open, b.high, b.low, b.close, b.volume
            );
        }
    }
    Ok(())
}

fn run_status(config: &ArchiveConfig) -> Result<()> {
    let layout = config.layout();
    println!("Data directory: {}", layout.data_dir.display());

    match BatchStateFile::new(layout.batch_state_path()).load() {
        Some(state) => println!(
            "Batch state:    batch {} of {} ({} completed)",
            state.current_batch, state.total_batches, state.completed_batches
        ),
        None => println!("Batch state:    none (no run in progress)"),
    }

    let width = config.download.symbol_width;
    match PendingQueue::new(layout.pending_path()).with_width(width).load() {
        Some(queue) => println!("Pending queue:  {} symbols", queue.len()),
        None => println!("Pending queue:  none"),
    }

    let ledger = FailureLedger::new(layout.failed_indexes_path(), layout.failed_stocks_path())
        .with_width(width);
    println!(
        "Failure ledger: {} stocks, {} indexes",
        ledger.failed_stocks().len(),
        ledger.failed_indexes().len()
    );

    match DownloadLog::load(&layout.download_log_path()) {
        Some(log) => {
            println!();
            println!("Last run:       {} -> {}", log.download_start_time, log.download_end_time);
            println!("Duration:       {} min", log.duration().num_minutes());
            println!("Batches:        {}", log.total_batches);
            println!(
                "Stocks:         {} processed, {} valid, {} skipped ({} up to date)",
                log.total_stocks_processed,
                log.total_valid_stocks,
                log.total_skipped_stocks,
                log.total_up_to_date_stocks
            );
            println!("New records:    {}", log.total_new_records);
            println!(
                "Failures:       {} stocks, {} indexes",
                log.failed_stocks_count, log.failed_indexes_count
            );
            println!("Dataset rows:   {}", log.dataset_rows);
        }
        None => println!("Last run:       none recorded"),
    }
    Ok(())
}

fn run_integrity(config: &ArchiveConfig, json: bool) -> Result<()> {
    let layout = config.layout();
    let store = open_store(config);
    let pacer = ThreadPacer;
    let constituents = ConstituentCache::new(layout.constituents_dir(), &pacer)
        .with_width(config.download.symbol_width);
    let report = IntegrityReport::build(&store, &constituents);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{:<8} {:<20} {:<8} {:>8} {:<12} {:>10}", "Index", "Name", "Snapshot", "Members", "As of", "No cache");
    println!("{}", "-".repeat(72));
    for i in &report.indexes {
        println!(
            "{:<8} {:<20} {:<8} {:>8} {:<12} {:>10}",
            i.index,
            i.name.as_deref().unwrap_or("-"),
            if i.snapshot_present { "yes" } else { "no" },
            i.member_count,
            i.snapshot_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
            i.members_without_fragment.len()
        );
    }
    println!();
    println!("Universe:              {} symbols", report.universe_size);
    println!(
        "Dataset:               {}",
        if report.dataset_present {
            format!("{} rows, {} symbols", report.dataset_rows, report.dataset_symbols)
        } else {
            "missing".into()
        }
    );
    println!("Missing from dataset:  {}", report.missing_from_dataset.len());
    println!("Outside universe:      {}", report.outside_universe.len());
    println!(
        "Fragments:             {} stocks, {} indexes",
        report.stock_fragments, report.index_fragments
    );
    println!("Clean:                 {}", if report.is_clean() { "yes" } else { "no" });
    Ok(())
}

fn run_cache_status(config: &ArchiveConfig) -> Result<()> {
    let store = open_store(config);
    let stats = cache_stats(&store);
    if stats.fragment_count == 0 {
        println!("Cache is empty: {}", store.cache_dir().display());
        return Ok(());
    }

    println!("Cache: {}", store.cache_dir().display());
    println!("Fragments: {}", stats.fragment_count);
    println!("Total size: {}", format_size(stats.total_bytes));
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        println!("Oldest write: {}", chrono::DateTime::<chrono::Local>::from(oldest).format("%Y-%m-%d %H:%M"));
        println!("Newest write: {}", chrono::DateTime::<chrono::Local>::from(newest).format("%Y-%m-%d %H:%M"));
    }
    println!();
    println!("{:<8} {:<25} {:>10} {:<9}", "Symbol", "Coverage", "Size", "Protected");
    println!("{}", "-".repeat(55));
    for s in &stats.symbols {
        println!(
            "{:<8} {:<25} {:>10} {:<9}",
            s.code,
            format!("{} to {}", s.first, s.last),
            format_size(s.size_bytes),
            if s.protected { "yes" } else { "" }
        );
    }
    Ok(())
}

fn run_cache_clean(config: &ArchiveConfig, days: u64, confirm: bool) -> Result<()> {
    let store = open_store(config);
    let old = clean_older_than(&store, days, SystemTime::now());
    if old.is_empty() {
        println!("No fragments older than {days} days to remove.");
        return Ok(());
    }

    println!("Found {} fragment(s) not written in {days} days:", old.len());
    for f in &old {
        println!("  {} ({})", f.name.code, format_size(f.size_bytes));
    }

    if !confirm {
        println!();
        println!("Dry run: pass --confirm to actually delete.");
        return Ok(());
    }

    let report = purge(&store, &old);
    println!(
        "Done. Removed {} fragment(s), freed {}.",
        report.removed.len(),
        format_size(report.bytes_freed)
    );
    if !report.failed.is_empty() {
        bail!("could not remove: {}", report.failed.join(", "));
    }
    Ok(())
}

fn run_cache_evict(config: &ArchiveConfig, symbols: &[String], confirm: bool) -> Result<()> {
    let store = open_store(config);
    let width = config.download.symbol_width;
    let codes: Vec<String> = symbols.iter().map(|s| normalize_code(s, width)).collect();

    for code in &codes {
        if store.protected().contains(code) {
            bail!("{code} is a protected index and cannot be evicted");
        }
    }

    if !confirm {
        for code in &codes {
            let present = store.fragment_path(code).is_some();
            println!("  {code}{}", if present { "" } else { " (not cached)" });
        }
        println!();
        println!("Dry run: pass --confirm to actually delete.");
        return Ok(());
    }

    for code in &codes {
        let removed = store.evict(code)?;
        println!("Evicted {code}: {removed} file(s)");
    }
    Ok(())
}
