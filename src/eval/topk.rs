//! Bounded selection of the most probable guesses.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::Path;

use crate::error::Result;
use crate::eval::source::{ChunkedLines, DEFAULT_CHUNK_SIZE, parse_scored_line};

/// Marker some generators append to guesses; never part of the password.
pub const GUESS_MARKER: char = '~';

pub fn strip_marker(guess: &str) -> String {
    guess.replace(GUESS_MARKER, "")
}

#[derive(Debug, Clone)]
pub struct Scored {
    pub probability: f64,
    pub password: String,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.probability
            .total_cmp(&other.probability)
            .then_with(|| self.password.cmp(&other.password))
    }
}

/// Min-heap holding the `k` highest-probability entries seen so far.
///
/// Memory stays O(k) however many entries are pushed. Duplicate passwords
/// are kept as separate entries.
#[derive(Debug, Clone)]
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Scored>>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(1 << 20)),
        }
    }

    pub fn push(&mut self, password: impl Into<String>, probability: f64) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(Reverse(Scored {
                probability,
                password: password.into(),
            }));
            return;
        }
        let beats_min = self
            .heap
            .peek()
            .is_some_and(|Reverse(min)| probability.total_cmp(&min.probability) == Ordering::Greater);
        if beats_min {
            self.heap.pop();
            self.heap.push(Reverse(Scored {
                probability,
                password: password.into(),
            }));
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Lowest retained probability.
    pub fn min_probability(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(s)| s.probability)
    }

    /// Retained entries, most probable first.
    pub fn into_sorted_vec(self) -> Vec<Scored> {
        // Sorting Reverse ascending yields the inner values descending
        self.heap.into_sorted_vec().into_iter().map(|Reverse(s)| s).collect()
    }
}

/// Select the `k` most probable guesses of a scored guess file
/// (`password probability` per line). Markers are stripped from passwords;
/// malformed lines are skipped.
pub fn topk_from_scored_file(path: &Path, k: usize) -> Result<TopK> {
    let mut top = TopK::new(k);
    let mut skipped = 0u64;
    for chunk in ChunkedLines::open(path, DEFAULT_CHUNK_SIZE)? {
        for line in chunk? {
            match parse_scored_line(&line) {
                Some((password, probability)) => top.push(strip_marker(password), probability),
                None => skipped += 1,
            }
        }
    }
    if skipped > 0 {
        tracing::debug!(path = %path.display(), skipped, "skipped malformed scored lines");
    }
    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keeps_k_highest() {
        let mut top = TopK::new(3);
        for (i, p) in [0.1, 0.9, 0.3, 0.7, 0.2, 0.8].iter().enumerate() {
            top.push(format!("pw{}", i), *p);
        }
        assert_eq!(top.len(), 3);
        assert_eq!(top.min_probability(), Some(0.7));

        let kept: Vec<f64> = top.into_sorted_vec().iter().map(|s| s.probability).collect();
        assert_eq!(kept, vec![0.9, 0.8, 0.7]);
    }

    #[test]
    fn test_size_is_min_of_k_and_n() {
        let mut top = TopK::new(10);
        top.push("a", 0.5);
        top.push("b", 0.4);
        assert_eq!(top.len(), 2);

        let mut none = TopK::new(0);
        none.push("a", 1.0);
        assert!(none.is_empty());
    }

    #[test]
    fn test_retained_dominate_discarded() {
        let probabilities: Vec<f64> = (0..500).map(|i| ((i * 7919) % 1000) as f64 / 1000.0).collect();
        let mut top = TopK::new(50);
        for (i, p) in probabilities.iter().enumerate() {
            top.push(i.to_string(), *p);
        }
        let min_kept = top.min_probability().unwrap();
        let kept: std::collections::HashSet<String> =
            top.into_sorted_vec().into_iter().map(|s| s.password).collect();
        for (i, p) in probabilities.iter().enumerate() {
            if !kept.contains(&i.to_string()) {
                assert!(*p <= min_kept);
            }
        }
    }

    #[test]
    fn test_nan_does_not_panic() {
        let mut top = TopK::new(2);
        top.push("a", f64::NAN);
        top.push("b", 0.5);
        top.push("c", 0.6);
        assert_eq!(top.len(), 2);
    }

    #[test]
    fn test_scored_file_strips_markers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("total_guesses.txt");
        std::fs::write(&path, "pass~ 0.5\nbad-line\nabc 0.1\nxyz~ 0.9\n").unwrap();

        let top = topk_from_scored_file(&path, 2).unwrap();
        let passwords: Vec<String> = top.into_sorted_vec().into_iter().map(|s| s.password).collect();
        assert_eq!(passwords, vec!["xyz", "pass"]);
    }

    #[test]
    fn test_strip_marker() {
        assert_eq!(strip_marker("pa~ss~"), "pass");
        assert_eq!(strip_marker("plain"), "plain");
    }
}
