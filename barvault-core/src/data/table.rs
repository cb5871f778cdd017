//! Text-table I/O for fragments and the canonical dataset.
//!
//! Every write goes to `{name}.tmp` first and is renamed into place, so a
//! crash mid-write leaves either the old file or the new one, never half
//! of either.

use std::fs;
use std::path::{Path, PathBuf};

use super::provider::DataError;
use crate::bar::{Bar, CanonicalRow};

/// Write `bytes` to `path` atomically, creating parent directories.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DataError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| DataError::CacheError(format!("failed to create dir: {e}")))?;
    }

    let tmp_path = tmp_path(path);
    fs::write(&tmp_path, bytes)
        .map_err(|e| DataError::CacheError(format!("write {}: {e}", tmp_path.display())))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DataError::CacheError(format!("atomic rename failed for {}: {e}", path.display()))
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read a bar table. A `date` column is required; other numeric columns
/// default to zero when absent.
pub fn read_bars(path: &Path) -> Result<Vec<Bar>, DataError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| DataError::CacheError(format!("open {}: {e}", path.display())))?;

    let headers = reader
        .headers()
        .map_err(|e| DataError::CacheError(format!("read header of {}: {e}", path.display())))?;
    if !headers.iter().any(|h| h == "date") {
        return Err(DataError::MissingColumn {
            column: "date".into(),
            context: path.display().to_string(),
        });
    }

    reader
        .deserialize::<Bar>()
        .map(|row| {
            row.map_err(|e| DataError::CacheError(format!("parse {}: {e}", path.display())))
        })
        .collect()
}

/// Serialize bars with every fragment column.
pub fn encode_bars(bars: &[Bar]) -> Result<Vec<u8>, DataError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for bar in bars {
        writer
            .serialize(bar)
            .map_err(|e| DataError::CacheError(format!("csv encode: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| DataError::CacheError(format!("csv flush: {e}")))
}

/// Serialize bars with the canonical column set only.
pub fn encode_canonical(bars: &[Bar]) -> Result<Vec<u8>, DataError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for bar in bars {
        writer
            .serialize(CanonicalRow::from(bar))
            .map_err(|e| DataError::CacheError(format!("csv encode: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| DataError::CacheError(format!("csv flush: {e}")))
}

pub fn write_bars(path: &Path, bars: &[Bar]) -> Result<(), DataError> {
    write_atomic(path, &encode_bars(bars)?)
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "barvault_table_test_{}_{id}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample() -> Vec<Bar> {
        let mut a = Bar::new(
            "000001",
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            10.0,
            10.5,
            9.8,
            10.2,
            120000.0,
        );
        a.amount = Some(1.2e6);
        let b = Bar::new(
            "000001",
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            10.2,
            10.4,
            10.0,
            10.1,
            90000.0,
        );
        vec![a, b]
    }

    #[test]
    fn write_then_read_preserves_rows() {
        let dir = temp_dir();
        let path = dir.join("nested").join("000001_20240102_20240103.csv");

        write_bars(&path, &sample()).unwrap();
        let loaded = read_bars(&path).unwrap();

        assert_eq!(loaded, sample());
        assert!(!tmp_path(&path).exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_numeric_columns_default_to_zero() {
        let dir = temp_dir();
        let path = dir.join("partial.csv");
        fs::write(&path, "date,symbol,close\n2024-01-02,399006,2000.5\n").unwrap();

        let loaded = read_bars(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].close, 2000.5);
        assert_eq!(loaded[0].volume, 0.0);
        assert_eq!(loaded[0].high, 0.0);
        assert_eq!(loaded[0].amount, None);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn table_without_date_column_is_structural_error() {
        let dir = temp_dir();
        let path = dir.join("bad.csv");
        fs::write(&path, "symbol,close\n000001,1.0\n").unwrap();

        match read_bars(&path) {
            Err(DataError::MissingColumn { column, .. }) => assert_eq!(column, "date"),
            other => panic!("expected MissingColumn, got {other:?}"),
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn canonical_encoding_has_fixed_header() {
        let bytes = encode_canonical(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("date,symbol,open,high,low,close,volume\n"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn remove_if_exists_tolerates_missing_files() {
        let dir = temp_dir();
        let path = dir.join("gone.csv");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, "x").unwrap();
        assert!(remove_if_exists(&path).unwrap());

        let _ = fs::remove_dir_all(&dir);
    }
}
