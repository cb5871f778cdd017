//! Persisted run position and the last run's summary.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::data::provider::DataError;
use crate::data::table::{remove_if_exists, write_atomic};

/// Position of a run in its batch sequence.
///
/// Transitions only move forward: [`BatchState::advance`] is the one way to
/// leave a batch, and a changed `total_batches` resets to batch 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchState {
    pub current_batch: usize,
    pub total_batches: usize,
    pub completed_batches: usize,
}

impl BatchState {
    pub fn fresh(total_batches: usize) -> Self {
        Self {
            current_batch: 1,
            total_batches,
            completed_batches: 0,
        }
    }

    /// State after `current_batch` has completed.
    pub fn advance(self) -> Self {
        Self {
            current_batch: self.current_batch + 1,
            total_batches: self.total_batches,
            completed_batches: self.current_batch,
        }
    }

    /// Where a run over `total_batches` should start given a saved state.
    pub fn resume_from(saved: Option<BatchState>, total_batches: usize) -> Self {
        match saved {
            Some(s) if s.total_batches == total_batches && s.current_batch >= 1 => s,
            Some(s) => {
                warn!(
                    saved_total = s.total_batches,
                    total_batches, "batch count changed, restarting at batch 1"
                );
                Self::fresh(total_batches)
            }
            None => Self::fresh(total_batches),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_batch > self.total_batches
    }
}

/// JSON file holding the [`BatchState`].
pub struct BatchStateFile {
    path: PathBuf,
}

impl BatchStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when absent or unreadable.
    pub fn load(&self) -> Option<BatchState> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt batch state");
                None
            }
        }
    }

    pub fn save(&self, state: &BatchState) -> Result<(), DataError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| DataError::StateError(format!("batch state serialization: {e}")))?;
        write_atomic(&self.path, json.as_bytes())
    }

    pub fn clear(&self) -> Result<(), DataError> {
        remove_if_exists(&self.path)
            .map(|_| ())
            .map_err(|e| DataError::StateError(format!("remove {}: {e}", self.path.display())))
    }
}

/// Summary of the most recently completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadLog {
    pub download_start_time: NaiveDateTime,
    pub download_end_time: NaiveDateTime,
    pub total_batches: usize,
    pub total_stocks_processed: usize,
    pub total_valid_stocks: usize,
    pub total_skipped_stocks: usize,
    pub total_up_to_date_stocks: usize,
    pub total_new_records: usize,
    pub failed_stocks_count: usize,
    pub failed_indexes_count: usize,
    #[serde(default)]
    pub dataset_rows: usize,
    #[serde(default)]
    pub dataset_hash: Option<String>,
}

impl DownloadLog {
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, path: &Path) -> Result<(), DataError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DataError::StateError(format!("download log serialization: {e}")))?;
        write_atomic(path, json.as_bytes())
    }

    pub fn duration(&self) -> chrono::Duration {
        self.download_end_time - self.download_start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn advance_moves_forward_by_one() {
        let s = BatchState::fresh(5).advance().advance();
        assert_eq!(
            s,
            BatchState {
                current_batch: 3,
                total_batches: 5,
                completed_batches: 2
            }
        );
        assert!(!s.is_finished());
        assert!(s.advance().advance().advance().is_finished());
    }

    #[test]
    fn resume_keeps_position_when_total_matches() {
        let saved = BatchState {
            current_batch: 3,
            total_batches: 5,
            completed_batches: 2,
        };
        assert_eq!(BatchState::resume_from(Some(saved), 5), saved);
    }

    #[test]
    fn resume_resets_when_total_changes() {
        let saved = BatchState {
            current_batch: 3,
            total_batches: 5,
            completed_batches: 2,
        };
        assert_eq!(BatchState::resume_from(Some(saved), 4), BatchState::fresh(4));
        assert_eq!(BatchState::resume_from(None, 4), BatchState::fresh(4));
    }

    #[test]
    fn state_file_round_trip_and_corruption() {
        let dir = tempdir().unwrap();
        let file = BatchStateFile::new(dir.path().join("batch_state.json"));
        assert_eq!(file.load(), None);

        let state = BatchState::fresh(3).advance();
        file.save(&state).unwrap();
        assert_eq!(file.load(), Some(state));

        fs::write(file.path(), "{ not json").unwrap();
        assert_eq!(file.load(), None);

        file.clear().unwrap();
        assert!(!file.path().exists());
    }

    #[test]
    fn download_log_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("download_log.json");
        let start = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let log = DownloadLog {
            download_start_time: start,
            download_end_time: start + chrono::Duration::minutes(90),
            total_batches: 3,
            total_stocks_processed: 400,
            total_valid_stocks: 390,
            total_skipped_stocks: 8,
            total_up_to_date_stocks: 5,
            total_new_records: 1200,
            failed_stocks_count: 2,
            failed_indexes_count: 0,
            dataset_rows: 10,
            dataset_hash: Some("abc".into()),
        };
        log.save(&path).unwrap();
        assert_eq!(DownloadLog::load(&path), Some(log.clone()));
        assert_eq!(log.duration(), chrono::Duration::minutes(90));
    }
}
