//! Set-similarity metrics across the guess files of completed runs.
//!
//! The first file of a combination is held in memory as a set; every later
//! file is streamed in chunks, so only one file's distinct guesses (plus the
//! union) are ever resident.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{BenchError, Result};
use crate::eval::results::append_csv;
use crate::eval::source::{ChunkedLines, DEFAULT_CHUNK_SIZE, read_lines};

const JACCARD_COLUMNS: [&str; 7] = ["Dataset", "Test", "Combo", "Settings", "Jaccard", "Intersect", "Union"];
const MERGEABILITY_COLUMNS: [&str; 5] = ["Dataset", "Test", "Combo", "Settings", "Mergeability"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Jaccard,
    Mergeability,
}

impl Metric {
    fn columns(self) -> &'static [&'static str] {
        match self {
            Metric::Jaccard => &JACCARD_COLUMNS,
            Metric::Mergeability => &MERGEABILITY_COLUMNS,
        }
    }

    pub fn table_name(self, mode: &str) -> String {
        match self {
            Metric::Jaccard => format!("jaccard-{}.csv", mode),
            Metric::Mergeability => format!("mergeability-{}.csv", mode),
        }
    }
}

/// All `c`-subsets of `0..n` in lexicographic order. `c == 0` yields the
/// single subset of every index; `c > n` (or `n == 0`) yields none.
pub fn combinations(n: usize, c: usize) -> Vec<Vec<usize>> {
    if n == 0 || c > n {
        return Vec::new();
    }
    if c == 0 || c == n {
        return vec![(0..n).collect()];
    }

    let mut out = Vec::new();
    let mut current: Vec<usize> = (0..c).collect();
    loop {
        out.push(current.clone());
        // Rightmost position that can still advance
        let Some(i) = (0..c).rev().find(|&i| current[i] < n - c + i) else {
            return out;
        };
        current[i] += 1;
        for j in i + 1..c {
            current[j] = current[j - 1] + 1;
        }
    }
}

/// Where a guess file sits in the results layout.
///
/// `…/<model>/<train_datasets>/<test-args>/<n_samples>/<train-hash>/guesses/<file>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLabel {
    pub model: String,
    pub dataset: String,
    pub settings: String,
    pub mode: String,
}

impl RunLabel {
    pub fn from_path(path: &Path) -> Result<Self> {
        let parts: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.len() < 7 {
            return Err(BenchError::config(format!(
                "{} is not inside a run output directory",
                path.display()
            )));
        }
        let back = |n: usize| parts[parts.len() - n].clone();

        Ok(Self {
            model: back(7),
            dataset: back(6),
            settings: back(5),
            mode: mode_from_file_name(&back(1)),
        })
    }
}

impl fmt::Display for RunLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} ({})", self.model, self.dataset, self.settings, self.mode)
    }
}

/// `guesses-guided.gz` → `guided`, `guesses.gz` → `sampling`.
fn mode_from_file_name(name: &str) -> String {
    let stem = name.strip_suffix(".gz").or_else(|| name.strip_suffix(".txt")).unwrap_or(name);
    let suffix = ["guesses", "sub-sampled", "matches"]
        .iter()
        .find_map(|prefix| stem.strip_prefix(prefix))
        .unwrap_or(stem);
    match suffix.trim_start_matches('-') {
        "" => "sampling".to_string(),
        other => other.to_string(),
    }
}

/// Intersection, union and per-file distinct sizes of a set of guess files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overlap {
    pub intersection: u64,
    pub union: u64,
    /// Distinct guesses per file; only filled for mergeability
    pub file_sizes: Vec<u64>,
}

impl Overlap {
    /// `|∩| / |∪|`, `None` on an empty union.
    pub fn jaccard(&self) -> Option<f64> {
        (self.union > 0).then(|| self.intersection as f64 / self.union as f64)
    }

    /// `(|∪| − max|file|) / max|file|`, `None` on an empty union.
    pub fn mergeability(&self) -> Option<f64> {
        let largest = self.file_sizes.iter().copied().max().unwrap_or(0);
        (self.union > 0 && largest > 0).then(|| (self.union - largest) as f64 / largest as f64)
    }
}

pub fn overlap(files: &[&Path], metric: Metric) -> Result<Overlap> {
    let Some((first, rest)) = files.split_first() else {
        return Ok(Overlap::default());
    };

    let mut intersection: HashSet<String> = read_lines(first)?.into_iter().collect();
    let mut union = intersection.clone();
    let mut file_sizes = Vec::new();
    if metric == Metric::Mergeability {
        file_sizes.push(union.len() as u64);
    }

    for file in rest {
        let mut narrowed = HashSet::new();
        let mut distinct = HashSet::new();
        for chunk in ChunkedLines::open(file, DEFAULT_CHUNK_SIZE)? {
            for guess in chunk? {
                if guess.is_empty() {
                    continue;
                }
                if metric == Metric::Jaccard && intersection.contains(&guess) {
                    narrowed.insert(guess.clone());
                }
                if metric == Metric::Mergeability {
                    distinct.insert(guess.clone());
                }
                union.insert(guess);
            }
        }
        if metric == Metric::Jaccard {
            intersection = narrowed;
        } else {
            file_sizes.push(distinct.len() as u64);
        }
    }

    Ok(Overlap {
        intersection: intersection.len() as u64,
        union: union.len() as u64,
        file_sizes,
    })
}

/// One computed metric row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub label: RunLabel,
    pub combo: String,
    pub value: f64,
    pub overlap_intersection: u64,
    pub overlap_union: u64,
}

impl MetricRow {
    fn record(&self, metric: Metric) -> Vec<String> {
        let mut record = vec![
            self.label.dataset.clone(),
            self.label.mode.clone(),
            self.combo.clone(),
            self.label.settings.clone(),
            self.value.to_string(),
        ];
        if metric == Metric::Jaccard {
            record.push(self.overlap_intersection.to_string());
            record.push(self.overlap_union.to_string());
        }
        record
    }
}

/// Compute `metric` for every `combination`-subset of `guess_files` and
/// append one row per subset to `<table_dir>/<metric>-<mode>.csv`.
pub fn cross_run(metric: Metric, guess_files: &[PathBuf], combination: usize, table_dir: &Path) -> Result<Vec<MetricRow>> {
    let labels = guess_files
        .iter()
        .map(|p| RunLabel::from_path(p))
        .collect::<Result<Vec<_>>>()?;

    let mut rows = Vec::new();
    for subset in combinations(guess_files.len(), combination) {
        let files: Vec<&Path> = subset.iter().map(|&i| guess_files[i].as_path()).collect();
        let mut models: Vec<&str> = subset.iter().map(|&i| labels[i].model.as_str()).collect();
        models.sort_unstable();
        let combo = models.join("_");

        let overlap = overlap(&files, metric)?;
        let value = match metric {
            Metric::Jaccard => overlap.jaccard(),
            Metric::Mergeability => overlap.mergeability(),
        };
        let Some(value) = value else {
            tracing::warn!(combo = %combo, "empty union, metric not computed");
            continue;
        };

        let row = MetricRow {
            label: labels[subset[0]].clone(),
            combo,
            value,
            overlap_intersection: overlap.intersection,
            overlap_union: overlap.union,
        };
        tracing::info!(combo = %row.combo, value, ?metric, "cross-run metric");

        let table = table_dir.join(metric.table_name(&row.label.mode));
        append_csv(&table, metric.columns(), &[row.record(metric)])?;
        rows.push(row);
    }
    Ok(rows)
}

/// Matches and distinct candidates of guess files against test files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub test_size: usize,
    pub matches: u64,
    pub uniques: u64,
}

impl EvaluationSummary {
    pub fn match_percentage(&self) -> f64 {
        if self.test_size == 0 {
            0.0
        } else {
            self.matches as f64 / self.test_size as f64 * 100.0
        }
    }
}

pub fn evaluate(guess_files: &[PathBuf], test_files: &[PathBuf]) -> Result<EvaluationSummary> {
    let mut test = HashSet::new();
    for file in test_files {
        test.extend(read_lines(file)?);
    }

    let mut matches: HashSet<String> = HashSet::new();
    let mut uniques: HashSet<String> = HashSet::new();
    for file in guess_files {
        for chunk in ChunkedLines::open(file, DEFAULT_CHUNK_SIZE)? {
            for guess in chunk? {
                if test.contains(&guess) && !matches.contains(&guess) {
                    matches.insert(guess.clone());
                }
                uniques.insert(guess);
            }
        }
        tracing::debug!(file = %file.display(), matches = matches.len(), "evaluated guess file");
    }

    Ok(EvaluationSummary {
        test_size: test.len(),
        matches: matches.len() as u64,
        uniques: uniques.len() as u64,
    })
}
