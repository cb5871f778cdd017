//! barvault core: resumable, batched, incremental daily-bar acquisition.
//!
//! This crate contains:
//! - Symbols, bars and the keep-last merge rule
//! - Provider trait, Yahoo provider and field normalization
//! - Per-symbol fragment store with atomic writes
//! - Trading calendar gate and constituent snapshots
//! - Fetch executor, batch scheduler and the fresh/resume acquisition run
//! - Consolidation into the canonical dataset and stale-fragment eviction
//! - Read API, integrity report and cache maintenance

pub mod bar;
pub mod config;
pub mod data;
pub mod integrity;
pub mod maintenance;
pub mod pipeline;
pub mod query;
pub mod symbol;

pub use bar::{dedup_keep_last, resolve, Bar};
pub use config::{ArchiveConfig, ArchiveLayout, ConfigError};
pub use data::DataError;
pub use symbol::{normalize_code, ProtectedIndexes, Symbol, SymbolKind};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: data and report types are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<Bar>();
        require_sync::<Bar>();
        require_send::<Symbol>();
        require_sync::<Symbol>();
        require_send::<ProtectedIndexes>();
        require_sync::<ProtectedIndexes>();
        require_send::<DataError>();
        require_sync::<DataError>();
        require_send::<ArchiveConfig>();
        require_sync::<ArchiveConfig>();

        require_send::<data::FragmentStore>();
        require_sync::<data::FragmentStore>();
        require_send::<data::ConstituentSnapshot>();
        require_sync::<data::ConstituentSnapshot>();
        require_send::<data::ProviderRow>();
        require_sync::<data::ProviderRow>();
        require_send::<data::YahooProvider>();
        require_sync::<data::YahooProvider>();

        require_send::<pipeline::BatchState>();
        require_sync::<pipeline::BatchState>();
        require_send::<pipeline::BatchStats>();
        require_sync::<pipeline::BatchStats>();
        require_send::<pipeline::DownloadLog>();
        require_sync::<pipeline::DownloadLog>();
        require_send::<pipeline::RunReport>();
        require_sync::<pipeline::RunReport>();
        require_send::<pipeline::ConsolidationReport>();
        require_sync::<pipeline::ConsolidationReport>();

        require_send::<query::QueryResult>();
        require_sync::<query::QueryResult>();
        require_send::<integrity::IntegrityReport>();
        require_sync::<integrity::IntegrityReport>();
    }

    /// The provider trait is object safe and usable behind a reference.
    #[test]
    fn provider_trait_is_object_safe() {
        fn _takes_dyn(p: &dyn data::DataProvider) -> &str {
            p.name()
        }
    }
}
