//! Guess and match files on disk.
//!
//! Every run keeps its generated candidates under `guesses/` and its
//! confirmed matches under `matches/`, gzip-compressed, one password per
//! line. Files are opened in append mode so a long evaluation can flush a
//! gzip member per batch; readers use a multi-member decoder.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::error::{BenchError, Result};
use crate::eval::source::{ChunkedLines, DEFAULT_CHUNK_SIZE};
use crate::eval::threshold::{MatchAccumulator, ThresholdEvaluator, ThresholdRow};
use crate::eval::topk::{GUESS_MARKER, strip_marker};

pub const GUESSES_DIR: &str = "guesses";
pub const MATCHES_DIR: &str = "matches";

/// Threshold ladder used when re-evaluating existing guess files.
pub const FAST_EVAL_LADDER: [u64; 11] = [
    1_000_000,
    2_500_000,
    5_000_000,
    7_500_000,
    10_000_000,
    25_000_000,
    50_000_000,
    75_000_000,
    100_000_000,
    250_000_000,
    500_000_000,
];

/// Ladder entries below `n_samples`, followed by `n_samples` itself.
pub fn fast_eval_thresholds(n_samples: u64) -> Vec<u64> {
    let mut thresholds: Vec<u64> = FAST_EVAL_LADDER.iter().copied().filter(|t| *t < n_samples).collect();
    thresholds.push(n_samples);
    thresholds
}

/// Append-mode gzip writer, one password per line.
///
/// Each batch is written as its own gzip member and flushed before
/// `write_batch` returns, so a file cut short by a crash still decodes up to
/// the last completed batch.
pub struct GuessWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
}

impl GuessWriter {
    pub fn append(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn write_batch<S: AsRef<str>>(&mut self, passwords: &[S]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(BenchError::stream(&self.path, "write after finish"));
        };
        if passwords.is_empty() {
            return Ok(());
        }
        let mut encoder = GzEncoder::new(&mut *file, Compression::default());
        for password in passwords {
            encoder.write_all(password.as_ref().as_bytes())?;
            encoder.write_all(b"\n")?;
        }
        encoder.finish()?;
        file.flush()?;
        self.written += passwords.len() as u64;
        Ok(())
    }

    /// Flush and release the file handle. Later writes fail.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

impl Drop for GuessWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to close guess file");
        }
    }
}

/// Write a whole password collection as a fresh gzip file.
pub fn write_passwords<'a, I>(path: &Path, passwords: I) -> Result<u64>
where
    I: IntoIterator<Item = &'a String>,
{
    if path.exists() {
        fs::remove_file(path)?;
    }
    let mut writer = GuessWriter::append(path)?;
    let mut batch: Vec<&str> = Vec::with_capacity(DEFAULT_CHUNK_SIZE);
    for password in passwords {
        batch.push(password);
        if batch.len() == DEFAULT_CHUNK_SIZE {
            writer.write_batch(&batch)?;
            batch.clear();
        }
    }
    writer.write_batch(&batch)?;
    writer.finish()?;
    Ok(writer.written())
}

/// Create `dir`, removing whatever a previous evaluation left in it.
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Copy the first `n` lines of `src` into a fresh gzip file at `dst`.
/// Returns how many lines were copied.
pub fn subsample(src: &Path, n: u64, dst: &Path) -> Result<u64> {
    if dst.exists() {
        fs::remove_file(dst)?;
    }
    let mut writer = GuessWriter::append(dst)?;
    for chunk in ChunkedLines::open(src, DEFAULT_CHUNK_SIZE)? {
        let chunk = chunk?;
        let remaining = (n - writer.written()) as usize;
        writer.write_batch(&chunk[..chunk.len().min(remaining)])?;
        if writer.written() >= n {
            break;
        }
    }
    writer.finish()?;
    tracing::debug!(src = %src.display(), dst = %dst.display(), lines = writer.written(), "sub-sampled guesses");
    Ok(writer.written())
}

/// Locate the guess file for an evaluation mode inside `dir`.
///
/// `<prefix><suffix>.gz` files are preferred in the order `guesses`,
/// `sub-sampled`; otherwise the first file (sorted) matching `*<suffix>.gz`.
pub fn resolve_guess_file(dir: &Path, suffix: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    for prefix in ["guesses", "sub-sampled"] {
        let exact = dir.join(format!("{}{}.gz", prefix, suffix));
        if exact.is_file() {
            return Ok(Some(exact));
        }
    }

    let pattern = format!("*{}.gz", suffix);
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| glob_match::glob_match(&pattern, name))
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Stream a guess file through threshold evaluation.
pub fn evaluate_guess_file(
    path: &Path,
    test: &HashSet<String>,
    thresholds: &[u64],
    track_distinct: bool,
) -> Result<(Vec<ThresholdRow>, MatchAccumulator)> {
    let mut evaluator = ThresholdEvaluator::new(test, thresholds, track_distinct);
    for chunk in ChunkedLines::open(path, DEFAULT_CHUNK_SIZE)? {
        let chunk = chunk?;
        if chunk.iter().any(|line| line.contains(GUESS_MARKER)) {
            evaluator.feed(chunk.iter().map(|line| strip_marker(line)));
        } else {
            evaluator.feed(&chunk);
        }
        if evaluator.is_done() {
            break;
        }
    }
    Ok(evaluator.finish())
}
