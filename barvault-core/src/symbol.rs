//! Canonical symbol codes and the protected index set.
//!
//! Every code entering the archive goes through [`normalize_code`]: exchange
//! suffixes and prefixes are stripped and numeric codes are zero-padded to a
//! fixed width, so `"1"`, `"000001.SZ"` and `"sz000001"` all name the same
//! instrument.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a canonical numeric code.
pub const DEFAULT_SYMBOL_WIDTH: usize = 6;

const SUFFIXES: [&str; 4] = [".SH", ".SZ", ".SS", ".BJ"];
const PREFIXES: [&str; 3] = ["SH", "SZ", "BJ"];

/// Whether a symbol is a tradable stock or a benchmark index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Stock,
    Index,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Stock => "stock",
            SymbolKind::Index => "index",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stock" => Some(SymbolKind::Stock),
            "index" => Some(SymbolKind::Index),
            _ => None,
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized symbol code tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    code: String,
    kind: SymbolKind,
}

impl Symbol {
    pub fn new(raw: &str, kind: SymbolKind, width: usize) -> Self {
        Self {
            code: normalize_code(raw, width),
            kind,
        }
    }

    pub fn stock(raw: &str) -> Self {
        Self::new(raw, SymbolKind::Stock, DEFAULT_SYMBOL_WIDTH)
    }

    pub fn index(raw: &str) -> Self {
        Self::new(raw, SymbolKind::Index, DEFAULT_SYMBOL_WIDTH)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    pub fn is_index(&self) -> bool {
        self.kind == SymbolKind::Index
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// Normalize a raw provider or user code into its canonical form.
///
/// Non-numeric codes are only trimmed and upper-cased.
pub fn normalize_code(raw: &str, width: usize) -> String {
    let upper = raw.trim().to_ascii_uppercase();

    let without_suffix = SUFFIXES
        .iter()
        .find_map(|s| upper.strip_suffix(s))
        .unwrap_or(upper.as_str());

    let bare = PREFIXES
        .iter()
        .find_map(|p| {
            without_suffix
                .strip_prefix(p)
                .filter(|rest| is_numeric(rest))
        })
        .unwrap_or(without_suffix);

    if is_numeric(bare) && bare.len() < width {
        format!("{bare:0>width$}")
    } else {
        bare.to_string()
    }
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// The statically configured set of benchmark indexes.
///
/// Protected codes are always fetched and never evicted, regardless of
/// constituent membership. Insertion order is the fetch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtectedIndexes {
    entries: Vec<(String, String)>,
}

impl ProtectedIndexes {
    pub fn new<I, C, N>(entries: I) -> Self
    where
        I: IntoIterator<Item = (C, N)>,
        C: AsRef<str>,
        N: Into<String>,
    {
        let mut set = Self::default();
        for (code, name) in entries {
            let code = normalize_code(code.as_ref(), DEFAULT_SYMBOL_WIDTH);
            if !set.contains(&code) {
                set.entries.push((code, name.into()));
            }
        }
        set
    }

    /// The seven style indexes tracked by default.
    pub fn style_defaults() -> Self {
        Self::new([
            ("000015", "Dividend"),
            ("399374", "Mid-cap Growth"),
            ("399324", "Shenzhen Dividend"),
            ("399376", "Small-cap Growth"),
            ("399006", "ChiNext"),
            ("399372", "Large-cap Growth"),
            ("399321", "National Dividend"),
        ])
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.iter().any(|(c, _)| c == code)
    }

    pub fn name(&self, code: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| c == code)
            .map(|(_, n)| n.as_str())
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.codes()
            .map(|c| Symbol {
                code: c.to_string(),
                kind: SymbolKind::Index,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_short_numeric_codes() {
        assert_eq!(normalize_code("1", 6), "000001");
        assert_eq!(normalize_code(" 600519 ", 6), "600519");
    }

    #[test]
    fn strips_exchange_decorations() {
        assert_eq!(normalize_code("000001.SZ", 6), "000001");
        assert_eq!(normalize_code("600000.sh", 6), "600000");
        assert_eq!(normalize_code("sz399006", 6), "399006");
        assert_eq!(normalize_code("SH000015", 6), "000015");
    }

    #[test]
    fn leaves_alphabetic_codes_alone() {
        assert_eq!(normalize_code("spy", 6), "SPY");
        // "SH" prefix is only stripped when digits follow
        assert_eq!(normalize_code("SHOP", 6), "SHOP");
    }

    #[test]
    fn symbol_constructors_normalize() {
        let s = Symbol::stock("1.SZ");
        assert_eq!(s.code(), "000001");
        assert_eq!(s.kind(), SymbolKind::Stock);
        assert!(Symbol::index("399006").is_index());
    }

    #[test]
    fn protected_set_keeps_order_and_dedups() {
        let set = ProtectedIndexes::new([("399006", "a"), ("15", "b"), ("399006.SZ", "c")]);
        let codes: Vec<&str> = set.codes().collect();
        assert_eq!(codes, vec!["399006", "000015"]);
        assert_eq!(set.name("000015"), Some("b"));
        assert!(set.symbols().iter().all(|s| s.is_index()));
    }

    #[test]
    fn style_defaults_has_seven_indexes() {
        let set = ProtectedIndexes::style_defaults();
        assert_eq!(set.len(), 7);
        assert!(set.contains("000015"));
        assert!(set.contains("399321"));
    }

    #[test]
    fn kind_round_trips_through_text() {
        assert_eq!(SymbolKind::parse(" Index "), Some(SymbolKind::Index));
        assert_eq!(SymbolKind::parse("stock"), Some(SymbolKind::Stock));
        assert_eq!(SymbolKind::parse("etf"), None);
        assert_eq!(SymbolKind::Index.to_string(), "index");
    }
}
