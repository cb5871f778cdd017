//! Data provider trait and structured error types.
//!
//! The DataProvider trait abstracts over remote bar sources so the pipeline
//! can swap implementations and mock them for tests. Providers return rows
//! with their own field names; the fetch executor maps them onto [`Bar`].
//!
//! [`Bar`]: crate::bar::Bar

use chrono::NaiveDate;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::symbol::Symbol;

/// Structured error types for archive operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("missing column '{column}' in {context}")]
    MissingColumn { column: String, context: String },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("state file error: {0}")]
    StateError(String),

    #[error("refusing to evict protected index {symbol}")]
    ProtectedSymbol { symbol: String },

    #[error("nothing to consolidate: no fragment could be loaded")]
    NothingToConsolidate,

    #[error("constituents unavailable for index {index}: {reason}")]
    ConstituentsUnavailable { index: String, reason: String },

    #[error("data error: {0}")]
    Other(String),
}

/// One row as delivered by a provider, keyed by provider-native field names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderRow {
    fields: BTreeMap<String, String>,
}

impl ProviderRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|v| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProviderRow {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut row = Self::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

/// Remote source of daily bars.
///
/// One call is one attempt: retries and pacing belong to the fetch executor.
pub trait DataProvider {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch daily rows for `symbol` over the inclusive range `[start, end]`.
    ///
    /// An empty vector means the provider had no rows for the range.
    fn fetch_daily_bars(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ProviderRow>, DataError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_row_builder_and_lookup() {
        let row = ProviderRow::new().with("日期", "2024-01-02").with("close", "9.5");
        assert_eq!(row.get("close"), Some("9.5"));
        assert_eq!(row.get("open"), None);
        assert_eq!(row.keys().count(), 2);
    }

    #[test]
    fn provider_row_from_pairs() {
        let row: ProviderRow = [("date", "2024-01-02"), ("volume", "100")]
            .into_iter()
            .collect();
        assert!(!row.is_empty());
        assert_eq!(row.get("volume"), Some("100"));
    }

    #[test]
    fn errors_render_for_humans() {
        let e = DataError::MissingColumn {
            column: "close".into(),
            context: "provider rows for 000001".into(),
        };
        assert_eq!(
            e.to_string(),
            "missing column 'close' in provider rows for 000001"
        );
        assert!(DataError::NothingToConsolidate
            .to_string()
            .contains("no fragment"));
    }
}
