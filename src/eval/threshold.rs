//! Incremental match accumulation against guess-count thresholds.
//!
//! Candidates are consumed one at a time, so a threshold `T` is reported
//! exactly when the `T`-th candidate has been seen, whatever the batch
//! boundaries. Once every threshold has been reported the evaluator refuses
//! further input and the caller stops reading.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;

/// Confirmed matches plus candidate counters.
#[derive(Debug, Clone, Default)]
pub struct MatchAccumulator {
    matches: HashSet<String>,
    observed: u64,
    distinct: Option<HashSet<String>>,
}

impl MatchAccumulator {
    pub fn new(track_distinct: bool) -> Self {
        Self {
            matches: HashSet::new(),
            observed: 0,
            distinct: track_distinct.then(HashSet::new),
        }
    }

    /// Count one candidate. Returns true when it is a match not seen before.
    pub fn observe(&mut self, candidate: &str, test: &HashSet<String>) -> bool {
        self.observed += 1;
        if let Some(distinct) = self.distinct.as_mut() {
            if !distinct.contains(candidate) {
                distinct.insert(candidate.to_string());
            }
        }
        if test.contains(candidate) && !self.matches.contains(candidate) {
            self.matches.insert(candidate.to_string());
            return true;
        }
        false
    }

    pub fn match_count(&self) -> u64 {
        self.matches.len() as u64
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }

    pub fn distinct_count(&self) -> Option<u64> {
        self.distinct.as_ref().map(|d| d.len() as u64)
    }

    pub fn matches(&self) -> &HashSet<String> {
        &self.matches
    }

    pub fn into_matches(self) -> HashSet<String> {
        self.matches
    }
}

/// `matches / test_size` as a percentage with two decimals. An empty test
/// set reads as 0%.
pub fn format_percentage(matches: u64, test_size: usize) -> String {
    if test_size == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", matches as f64 / test_size as f64 * 100.0)
}

/// One reported threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdRow {
    pub test_size: usize,
    pub generated: u64,
    pub matches: u64,
    pub match_percentage: String,
    pub uniques: Option<u64>,
}

impl ThresholdRow {
    pub fn new(test_size: usize, generated: u64, matches: u64, uniques: Option<u64>) -> Self {
        Self {
            test_size,
            generated,
            matches,
            match_percentage: format_percentage(matches, test_size),
            uniques,
        }
    }
}

pub struct ThresholdEvaluator<'a> {
    test: &'a HashSet<String>,
    pending: VecDeque<u64>,
    acc: MatchAccumulator,
    rows: Vec<ThresholdRow>,
}

impl<'a> ThresholdEvaluator<'a> {
    /// Thresholds are sorted and deduplicated; zero is ignored.
    pub fn new(test: &'a HashSet<String>, thresholds: &[u64], track_distinct: bool) -> Self {
        let mut sorted: Vec<u64> = thresholds.iter().copied().filter(|t| *t > 0).collect();
        sorted.sort_unstable();
        sorted.dedup();
        Self {
            test,
            pending: sorted.into(),
            acc: MatchAccumulator::new(track_distinct),
            rows: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn accumulator(&self) -> &MatchAccumulator {
        &self.acc
    }

    /// Consume candidates until the input or the thresholds run out.
    /// Returns the matches first seen in this call.
    pub fn feed<I, S>(&mut self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut fresh = Vec::new();
        for candidate in candidates {
            let Some(&next) = self.pending.front() else {
                break;
            };
            let candidate = candidate.as_ref();
            if self.acc.observe(candidate, self.test) {
                fresh.push(candidate.to_string());
            }
            if self.acc.observed() == next {
                self.pending.pop_front();
                self.push_row();
            }
        }
        fresh
    }

    fn push_row(&mut self) {
        let row = ThresholdRow::new(
            self.test.len(),
            self.acc.observed(),
            self.acc.match_count(),
            self.acc.distinct_count(),
        );
        tracing::debug!(
            generated = row.generated,
            matches = row.matches,
            percentage = %row.match_percentage,
            "threshold reached"
        );
        self.rows.push(row);
    }

    /// Close the stream. When it ended early a final row at the true count is
    /// appended, unless that count was itself just reported.
    pub fn finish(mut self) -> (Vec<ThresholdRow>, MatchAccumulator) {
        let already = self.rows.last().is_some_and(|r| r.generated == self.acc.observed());
        if !self.pending.is_empty() && !already {
            self.push_row();
        }
        if self.rows.is_empty() {
            self.push_row();
        }
        (self.rows, self.acc)
    }
}
