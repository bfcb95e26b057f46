//! Proxy-evaluation tracking during training.
//!
//! Every `checkpoint_frequency` epochs the model is scored on a fixed proxy
//! sample budget. The tracker decides two things from the proxy match count:
//!
//! - whether to write a new mid checkpoint: the count reaches the best seen
//!   so far *and* moved up since the previous observation, so a plateau at
//!   an unchanged count does not rewrite the file;
//! - whether to stop: once past `start_fraction` of the epochs, a count below
//!   `floor(best * (1 + min_relative_margin))` is a miss, anything else resets
//!   the miss counter, and `patience` consecutive misses end training.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    pub patience: usize,
    pub start_fraction: f64,
    pub min_relative_margin: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 10,
            start_fraction: 0.5,
            min_relative_margin: 0.05,
        }
    }
}

/// Outcome of one proxy observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyDecision {
    pub save_mid: bool,
    pub stop: bool,
}

#[derive(Debug, Clone)]
pub struct ProxyTracker {
    config: EarlyStoppingConfig,
    total_epochs: usize,
    best: u64,
    previous: Option<u64>,
    misses: usize,
    stopped: bool,
}

impl ProxyTracker {
    pub fn new(config: EarlyStoppingConfig, total_epochs: usize) -> Self {
        Self {
            config,
            total_epochs,
            best: 0,
            previous: None,
            misses: 0,
            stopped: false,
        }
    }

    pub fn best(&self) -> u64 {
        self.best
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn should_stop(&self) -> bool {
        self.stopped
    }

    fn in_stopping_window(&self, epoch: usize) -> bool {
        epoch as f64 >= self.total_epochs as f64 * self.config.start_fraction
    }

    /// Record the proxy match count observed after `epoch` (1-based).
    pub fn observe(&mut self, epoch: usize, matches: u64) -> ProxyDecision {
        if self.in_stopping_window(epoch) {
            let threshold = (self.best as f64 * (1.0 + self.config.min_relative_margin)).floor() as u64;
            if matches < threshold {
                self.misses += 1;
            } else {
                self.misses = 0;
            }
            if self.misses >= self.config.patience {
                self.stopped = true;
            }
        }

        let moved_up = self.previous.is_none_or(|prev| matches > prev);
        let save_mid = matches >= self.best && moved_up;
        if save_mid {
            self.best = matches;
        }
        self.previous = Some(matches);

        ProxyDecision {
            save_mid,
            stop: self.stopped,
        }
    }
}
