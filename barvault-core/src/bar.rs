//! Daily bar records and the keep-last merge rule.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One trading day for one symbol, as stored in fragments.
///
/// Numeric columns missing from a stored table deserialize as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub change_percent: Option<f64>,
}

impl Bar {
    /// A bar with only the required columns set.
    pub fn new(
        symbol: impl Into<String>,
        date: NaiveDate,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            date,
            symbol: symbol.into(),
            open,
            high,
            low,
            close,
            volume,
            amount: None,
            change_percent: None,
        }
    }
}

/// Row of the canonical dataset: the fixed column set, nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub date: NaiveDate,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Bar> for CanonicalRow {
    fn from(bar: &Bar) -> Self {
        Self {
            date: bar.date,
            symbol: bar.symbol.clone(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

/// Stable-sort by (symbol, date) and keep the last occurrence of each key.
///
/// Rows later in the input win, so `dedup_keep_last(existing ++ incoming)`
/// resolves every conflict in favour of `incoming`.
pub fn dedup_keep_last(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by(|a, b| (a.symbol.as_str(), a.date).cmp(&(b.symbol.as_str(), b.date)));

    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(prev) if prev.symbol == bar.symbol && prev.date == bar.date => *prev = bar,
            _ => out.push(bar),
        }
    }
    out
}

/// Merge incoming rows over an existing series.
pub fn resolve(existing: Vec<Bar>, incoming: Vec<Bar>) -> Vec<Bar> {
    let mut all = existing;
    all.extend(incoming);
    dedup_keep_last(all)
}
