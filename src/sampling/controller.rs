//! Feedback controller for guided sampling.
//!
//! Newly confirmed matches enter a retry dictionary with a zero counter.
//! Once enough distinct matches exist, each batch is steered around anchors
//! drawn uniformly (with replacement) from the dictionary as it stood before
//! the batch. Every draw then bumps the anchor's counter, and an anchor drawn
//! more than `gamma` times retires for good.

use std::collections::{HashMap, HashSet, VecDeque};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::Steering;

/// Window of the novel-match running mean.
pub const RUNNING_MEAN_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuidedSamplingParams {
    /// Distinct matches required before steering starts
    pub alpha: u64,
    /// Spread around each anchor
    pub sigma: f64,
    /// Draws allowed per anchor before it retires
    pub gamma: u32,
}

impl GuidedSamplingParams {
    /// Defaults tiered by the run's sample budget.
    pub fn for_sample_count(n_samples: u64) -> Self {
        let (alpha, sigma, gamma) = match n_samples {
            0..=100_000 => (1, 0.12, 2),
            100_001..=1_000_000 => (5, 0.12, 10),
            1_000_001..=10_000_000 => (50, 0.12, 10),
            _ => (50, 0.15, 10),
        };
        Self { alpha, sigma, gamma }
    }
}

impl Default for GuidedSamplingParams {
    fn default() -> Self {
        Self::for_sample_count(1_000_000)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SteeringRequest {
    Unsteered,
    Steered(Steering),
}

pub struct AdaptiveSamplingController<R: Rng> {
    params: GuidedSamplingParams,
    rng: R,
    // Retry dictionary as parallel vectors plus a position index, so that
    // uniform draws and removals are both O(1).
    keys: Vec<String>,
    counters: Vec<u32>,
    index: HashMap<String, usize>,
    seen: HashSet<String>,
    steering: bool,
}

impl<R: Rng> AdaptiveSamplingController<R> {
    pub fn new(params: GuidedSamplingParams, rng: R) -> Self {
        Self {
            params,
            rng,
            keys: Vec::new(),
            counters: Vec::new(),
            index: HashMap::new(),
            seen: HashSet::new(),
            steering: false,
        }
    }

    pub fn params(&self) -> &GuidedSamplingParams {
        &self.params
    }

    /// Add matches confirmed by the last batch. Passwords seen before,
    /// including retired anchors, are ignored.
    pub fn record_matches<I, S>(&mut self, fresh: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for password in fresh {
            let password = password.into();
            if self.seen.insert(password.clone()) {
                self.index.insert(password.clone(), self.keys.len());
                self.keys.push(password);
                self.counters.push(0);
            }
        }
    }

    /// Decide how the next batch of `batch_size` candidates is generated.
    pub fn next_request(&mut self, batch_size: usize) -> SteeringRequest {
        if (self.seen.len() as u64) < self.params.alpha || self.keys.is_empty() {
            self.steering = false;
            return SteeringRequest::Unsteered;
        }

        // The whole batch is drawn from the dictionary as it stands now;
        // counters and retirements apply afterwards.
        let anchors: Vec<String> = (0..batch_size)
            .map(|_| self.keys[self.rng.gen_range(0..self.keys.len())].clone())
            .collect();

        for anchor in &anchors {
            let Some(&slot) = self.index.get(anchor) else {
                continue;
            };
            self.counters[slot] += 1;
            if self.counters[slot] > self.params.gamma {
                self.retire(slot);
            }
        }

        self.steering = true;
        SteeringRequest::Steered(Steering {
            anchors,
            sigma: self.params.sigma,
        })
    }

    fn retire(&mut self, slot: usize) {
        let key = self.keys.swap_remove(slot);
        self.counters.swap_remove(slot);
        self.index.remove(&key);
        if let Some(moved) = self.keys.get(slot) {
            self.index.insert(moved.clone(), slot);
        }
    }

    pub fn is_steering(&self) -> bool {
        self.steering
    }

    pub fn distinct_matches(&self) -> u64 {
        self.seen.len() as u64
    }

    /// Anchors still eligible for drawing.
    pub fn active_anchors(&self) -> usize {
        self.keys.len()
    }

    pub fn counter(&self, password: &str) -> Option<u32> {
        self.index.get(password).map(|&slot| self.counters[slot])
    }
}

/// Mean of the last `window` observations.
#[derive(Debug, Clone)]
pub struct RunningMean {
    window: usize,
    values: VecDeque<u64>,
    sum: u64,
}

impl RunningMean {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            values: VecDeque::with_capacity(window.max(1)),
            sum: 0,
        }
    }

    pub fn push(&mut self, value: u64) -> f64 {
        if self.values.len() == self.window {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.mean()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.values.len() as f64
        }
    }
}

impl Default for RunningMean {
    fn default() -> Self {
        Self::new(RUNNING_MEAN_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn controller(alpha: u64, gamma: u32) -> AdaptiveSamplingController<StdRng> {
        let params = GuidedSamplingParams {
            alpha,
            sigma: 0.12,
            gamma,
        };
        AdaptiveSamplingController::new(params, StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_tiers() {
        assert_eq!(GuidedSamplingParams::for_sample_count(100_000).alpha, 1);
        assert_eq!(GuidedSamplingParams::for_sample_count(100_000).gamma, 2);
        assert_eq!(GuidedSamplingParams::for_sample_count(1_000_000).alpha, 5);
        assert_eq!(GuidedSamplingParams::for_sample_count(10_000_000).alpha, 50);
        let large = GuidedSamplingParams::for_sample_count(10_000_001);
        assert_eq!((large.alpha, large.sigma, large.gamma), (50, 0.15, 10));
    }

    #[test]
    fn test_unsteered_below_alpha() {
        let mut c = controller(3, 2);
        c.record_matches(["a", "b"]);
        assert_eq!(c.next_request(4), SteeringRequest::Unsteered);
        assert!(!c.is_steering());

        c.record_matches(["c"]);
        assert!(matches!(c.next_request(4), SteeringRequest::Steered(_)));
        assert!(c.is_steering());
    }

    #[test]
    fn test_counters_bounded_and_retired_keys_never_drawn() {
        let mut c = controller(1, 2);
        c.record_matches(["a", "b", "c", "d"]);
        let mut retired: HashSet<String> = HashSet::new();

        for _ in 0..20 {
            if let SteeringRequest::Steered(s) = c.next_request(3) {
                assert_eq!(s.anchors.len(), 3);
                assert!(s.anchors.iter().all(|a| !retired.contains(a)));
            }
            for key in ["a", "b", "c", "d"] {
                match c.counter(key) {
                    Some(n) => assert!(n <= 2),
                    None => {
                        retired.insert(key.to_string());
                    }
                }
            }
        }

        assert_eq!(c.active_anchors(), 0);
        assert_eq!(c.next_request(3), SteeringRequest::Unsteered);
    }

    #[test]
    fn test_batch_drawn_from_dictionary_before_retirement() {
        let mut c = controller(1, 4);
        c.record_matches(["a", "b", "c"]);

        let SteeringRequest::Steered(s) = c.next_request(12) else {
            panic!("expected a steered batch");
        };
        assert_eq!(s.anchors.len(), 12);

        for key in ["a", "b", "c"] {
            let drawn = s.anchors.iter().filter(|a| a.as_str() == key).count() as u32;
            if drawn > 4 {
                assert_eq!(c.counter(key), None);
            } else {
                assert_eq!(c.counter(key), Some(drawn));
            }
        }
    }

    #[test]
    fn test_retired_match_is_not_readded() {
        let mut c = controller(1, 0);
        c.record_matches(["only"]);
        let SteeringRequest::Steered(s) = c.next_request(5) else {
            panic!("expected a steered batch");
        };
        assert_eq!(s.anchors, vec!["only".to_string(); 5]);
        assert_eq!(c.active_anchors(), 0);

        c.record_matches(["only"]);
        assert_eq!(c.active_anchors(), 0);
        assert_eq!(c.distinct_matches(), 1);
    }

    #[test]
    fn test_index_survives_swap_remove() {
        let mut c = controller(1, 1000);
        c.record_matches(["a", "b", "c"]);
        c.retire(0);
        assert_eq!(c.counter("a"), None);
        assert_eq!(c.counter("c"), Some(0));
        assert_eq!(c.index["c"], 0);
    }

    #[test]
    fn test_running_mean_window() {
        let mut mean = RunningMean::new(2);
        assert_eq!(mean.push(4), 4.0);
        assert_eq!(mean.push(2), 3.0);
        assert_eq!(mean.push(0), 1.0);
    }
}
