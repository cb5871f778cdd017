//! Failure ledger and pending queue.
//!
//! The ledger is append-only: every exhausted fetch adds one `kind: code`
//! line to the partition of its kind. Re-appending a symbol is harmless;
//! duplicates are dropped when the ledger is read back.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::data::provider::DataError;
use crate::data::table::{remove_if_exists, write_atomic};
use crate::symbol::{normalize_code, Symbol, SymbolKind, DEFAULT_SYMBOL_WIDTH};

/// Two-partition failure ledger.
pub struct FailureLedger {
    index_path: PathBuf,
    stock_path: PathBuf,
    width: usize,
}

impl FailureLedger {
    pub fn new(index_path: impl Into<PathBuf>, stock_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            stock_path: stock_path.into(),
            width: DEFAULT_SYMBOL_WIDTH,
        }
    }

    /// Code width used to normalize codes read back from the ledger.
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    fn path_for(&self, kind: SymbolKind) -> &Path {
        match kind {
            SymbolKind::Index => &self.index_path,
            SymbolKind::Stock => &self.stock_path,
        }
    }

    /// Append a failure for `symbol` to its partition.
    pub fn record(&self, symbol: &Symbol) -> Result<(), DataError> {
        let path = self.path_for(symbol.kind());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DataError::StateError(format!("failed to create dir: {e}")))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DataError::StateError(format!("open {}: {e}", path.display())))?;
        writeln!(file, "{}: {}", symbol.kind(), symbol.code())
            .and_then(|_| file.flush())
            .map_err(|e| DataError::StateError(format!("append {}: {e}", path.display())))
    }

    /// Distinct failed codes of one kind, in first-failure order.
    ///
    /// Lines tagged with another kind are ignored; untagged lines are taken
    /// as bare codes.
    pub fn failed(&self, kind: SymbolKind) -> Vec<String> {
        let path = self.path_for(kind);
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failure ledger unreadable");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        content
            .lines()
            .filter_map(|line| parse_line(line, kind, self.width))
            .filter(|code| seen.insert(code.clone()))
            .collect()
    }

    pub fn failed_stocks(&self) -> Vec<String> {
        self.failed(SymbolKind::Stock)
    }

    pub fn failed_indexes(&self) -> Vec<String> {
        self.failed(SymbolKind::Index)
    }

    /// Remove both partitions.
    pub fn clear(&self) -> Result<(), DataError> {
        for path in [&self.index_path, &self.stock_path] {
            remove_if_exists(path)
                .map_err(|e| DataError::StateError(format!("remove {}: {e}", path.display())))?;
        }
        Ok(())
    }
}

fn parse_line(line: &str, kind: SymbolKind, width: usize) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let code = match line.split_once(':') {
        Some((tag, code)) => {
            if SymbolKind::parse(tag)? != kind {
                return None;
            }
            code.trim()
        }
        None => line,
    };
    if code.is_empty() {
        return None;
    }
    Some(normalize_code(code, width))
}

/// Symbols still to fetch, one per line.
pub struct PendingQueue {
    path: PathBuf,
    width: usize,
}

impl PendingQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            width: DEFAULT_SYMBOL_WIDTH,
        }
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no queue has been persisted.
    pub fn load(&self) -> Option<Vec<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "pending queue unreadable");
                return None;
            }
        };
        Some(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| normalize_code(l, self.width))
                .collect(),
        )
    }

    pub fn save(&self, codes: &[String]) -> Result<(), DataError> {
        let mut body = codes.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        write_atomic(&self.path, body.as_bytes())
    }

    pub fn clear(&self) -> Result<(), DataError> {
        remove_if_exists(&self.path)
            .map(|_| ())
            .map_err(|e| DataError::StateError(format!("remove {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger_in(dir: &Path) -> FailureLedger {
        FailureLedger::new(
            dir.join("failed_indexes.txt"),
            dir.join("failed_stocks.txt"),
        )
    }

    #[test]
    fn records_by_partition() {
        let dir = tempdir().unwrap();
        let ledger = ledger_in(dir.path());

        ledger.record(&Symbol::stock("000001")).unwrap();
        ledger.record(&Symbol::index("399006")).unwrap();

        assert_eq!(ledger.failed_stocks(), vec!["000001"]);
        assert_eq!(ledger.failed_indexes(), vec!["399006"]);

        let raw = fs::read_to_string(dir.path().join("failed_stocks.txt")).unwrap();
        assert_eq!(raw, "stock: 000001\n");
    }

    #[test]
    fn duplicates_are_dropped_on_read() {
        let dir = tempdir().unwrap();
        let ledger = ledger_in(dir.path());

        for code in ["000002", "000001", "000002", "000001"] {
            ledger.record(&Symbol::stock(code)).unwrap();
        }
        assert_eq!(ledger.failed_stocks(), vec!["000002", "000001"]);
    }

    #[test]
    fn tolerates_foreign_and_bare_lines() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("failed_stocks.txt"),
            "stock: 2\n\nindex: 399006\nstock:600000\n300750\ngarbage: 1\n",
        )
        .unwrap();
        let ledger = ledger_in(dir.path());
        assert_eq!(ledger.failed_stocks(), vec!["000002", "600000", "300750"]);
    }

    #[test]
    fn configured_width_applies_on_read() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("failed_stocks.txt"), "stock: 123\nstock: 00123\n").unwrap();
        fs::write(dir.path().join("pending_stocks.txt"), "7\n4567\n").unwrap();

        let ledger = ledger_in(dir.path()).with_width(5);
        assert_eq!(ledger.failed_stocks(), vec!["00123"]);

        let queue = PendingQueue::new(dir.path().join("pending_stocks.txt")).with_width(5);
        assert_eq!(
            queue.load(),
            Some(vec!["00007".to_string(), "04567".to_string()])
        );
    }

    #[test]
    fn clear_removes_both_partitions() {
        let dir = tempdir().unwrap();
        let ledger = ledger_in(dir.path());
        ledger.record(&Symbol::stock("000001")).unwrap();
        ledger.clear().unwrap();
        ledger.clear().unwrap();
        assert!(ledger.failed_stocks().is_empty());
    }

    #[test]
    fn pending_queue_lifecycle() {
        let dir = tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("pending_stocks.txt"));
        assert_eq!(queue.load(), None);

        queue.save(&["000001".into(), "600000".into()]).unwrap();
        assert_eq!(
            queue.load(),
            Some(vec!["000001".to_string(), "600000".to_string()])
        );

        queue.save(&[]).unwrap();
        assert_eq!(queue.load(), Some(Vec::new()));

        queue.clear().unwrap();
        assert_eq!(queue.load(), None);
    }
}
