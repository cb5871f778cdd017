pub mod consolidate;
pub mod executor;
pub mod ledger;
pub mod run;
pub mod scheduler;
pub mod state;

pub use consolidate::{Cleanup, ConsolidationReport, Consolidator};
pub use executor::{FetchExecutor, FetchOutcome, RetryPolicy};
pub use ledger::{FailureLedger, PendingQueue};
pub use run::{AcquisitionRun, RunContext, RunMode, RunReport, RunStatus, RunTotals};
pub use scheduler::{BatchPlan, BatchProgress, BatchScheduler, BatchStats, LogProgress, SymbolOutcome};
pub use state::{BatchState, BatchStateFile, DownloadLog};
