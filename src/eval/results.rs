//! Append-only CSV results tables.
//!
//! Several runs of one scenario append to the same table, possibly from
//! different threads or processes. Each append takes an exclusive `fs2` lock
//! on the file, writes the header when the file is empty, then its rows.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{BenchError, Result};
use crate::eval::threshold::ThresholdRow;

pub const RESULT_COLUMNS: [&str; 9] = [
    "model",
    "train-dataset",
    "test-settings",
    "test-hash",
    "test-size",
    "#gen",
    "#matches",
    "match_percentage",
    "#uniques",
];

/// One results-table row: a run's identity plus one reported threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub model: String,
    pub train_dataset: String,
    pub test_settings: String,
    pub test_hash: String,
    pub row: ThresholdRow,
}

impl ResultRow {
    fn record(&self) -> Vec<String> {
        vec![
            self.model.clone(),
            self.train_dataset.clone(),
            self.test_settings.clone(),
            self.test_hash.clone(),
            self.row.test_size.to_string(),
            self.row.generated.to_string(),
            self.row.matches.to_string(),
            self.row.match_percentage.clone(),
            self.row.uniques.map(|u| u.to_string()).unwrap_or_default(),
        ]
    }
}

fn table_err(path: &Path, reason: impl ToString) -> BenchError {
    BenchError::ResultsTable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Append `rows` to a CSV file under an exclusive lock, writing `header`
/// first when the file is new or empty.
pub fn append_csv(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| table_err(path, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
        .map_err(|e| table_err(path, e))?;
    file.lock_exclusive().map_err(|e| table_err(path, format!("lock: {}", e)))?;

    let outcome = (|| -> std::result::Result<(), String> {
        let empty = file.seek(SeekFrom::End(0)).map_err(|e| e.to_string())? == 0;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(&file);
        if empty {
            writer.write_record(header).map_err(|e| e.to_string())?;
        }
        for row in rows {
            writer.write_record(row).map_err(|e| e.to_string())?;
        }
        writer.flush().map_err(|e| e.to_string())
    })();

    let unlocked = FileExt::unlock(&file);
    outcome.map_err(|reason| table_err(path, reason))?;
    unlocked.map_err(|e| table_err(path, format!("unlock: {}", e)))
}

/// The per-scenario results table.
#[derive(Debug, Clone)]
pub struct ResultsTable {
    path: PathBuf,
}

impl ResultsTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, rows: &[ResultRow]) -> Result<()> {
        let records: Vec<Vec<String>> = rows.iter().map(ResultRow::record).collect();
        append_csv(&self.path, &RESULT_COLUMNS, &records)?;
        tracing::debug!(path = %self.path.display(), rows = rows.len(), "appended results");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(generated: u64, matches: u64) -> ResultRow {
        ResultRow {
            model: "ngram".into(),
            train_dataset: "rockyou".into(),
            test_settings: "16-all".into(),
            test_hash: "abc123".into(),
            row: ThresholdRow::new(3, generated, matches, None),
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let table = ResultsTable::new(dir.path().join("scenario").join("output.csv"));
        table.append(&[row(2, 1)]).unwrap();
        table.append(&[row(4, 2)]).unwrap();

        let content = fs::read_to_string(table.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], RESULT_COLUMNS.join(","));
        assert_eq!(lines[1], "ngram,rockyou,16-all,abc123,3,2,1,33.33%,");
        assert_eq!(lines[2], "ngram,rockyou,16-all,abc123,3,4,2,66.67%,");
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let path = path.clone();
                s.spawn(move || {
                    let table = ResultsTable::new(path);
                    for i in 0..10 {
                        table.append(&[row(t * 100 + i, 0)]).unwrap();
                    }
                });
            }
        });

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 40);
        assert!(records.iter().all(|r| r.len() == RESULT_COLUMNS.len()));
    }

    #[test]
    fn test_unwritable_path_is_results_table_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let err = ResultsTable::new(blocker.join("output.csv")).append(&[row(1, 0)]).unwrap_err();
        assert!(matches!(err, BenchError::ResultsTable { .. }));
        assert!(err.is_fatal_for_invocation());
    }
}
