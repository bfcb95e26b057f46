//! Character n-gram reference model.
//!
//! Counts character continuations for every context length up to
//! `order - 1` and samples with back-off to shorter contexts. Each epoch
//! counts one shard of the training data, so the proxy match count grows
//! over training like it would for a learned model.
//!
//! Steering keeps a prefix of the anchor password (each character survives
//! with probability `1 - sigma`) and completes it from the model.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{GeneratedBatch, Generator, ModelSettings, PasswordModel, Steering};
use crate::error::{BenchError, LoadError, Result};
use crate::eval::{self, EvalPlan, EvalReport, EvalSinks};

pub const MODEL_NAME: &str = "ngram";

const START: char = '\u{2}';
const END: char = '\u{3}';
const DEFAULT_ORDER: usize = 4;

pub fn construct(settings: &ModelSettings) -> Result<Box<dyn PasswordModel>> {
    let order = settings.extra_i64("order").unwrap_or(DEFAULT_ORDER as i64);
    if !(1..=16).contains(&order) {
        return Err(BenchError::config(format!("ngram order must be in 1..=16, got {}", order)));
    }
    let seed = settings.extra_i64("seed").unwrap_or(0) as u64;
    Ok(Box::new(NgramModel::new(order as usize, seed)))
}

/// Persisted part of the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct NgramState {
    order: usize,
    max_length: usize,
    epochs_trained: usize,
    /// context → continuation counts, for every context length < order
    counts: HashMap<String, BTreeMap<char, u64>>,
}

pub struct NgramModel {
    state: NgramState,
    train: Vec<String>,
    rng: StdRng,
    steering: Option<Steering>,
}

impl NgramModel {
    pub fn new(order: usize, seed: u64) -> Self {
        Self {
            state: NgramState {
                order,
                max_length: 32,
                ..Default::default()
            },
            train: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            steering: None,
        }
    }

    fn count(&mut self, password: &str) {
        let chars: Vec<char> = std::iter::repeat(START)
            .take(self.state.order.saturating_sub(1))
            .chain(password.chars())
            .chain(std::iter::once(END))
            .collect();
        let history = self.state.order.saturating_sub(1);

        for pos in history..chars.len() {
            for len in 0..=history {
                let context: String = chars[pos - len..pos].iter().collect();
                *self
                    .state
                    .counts
                    .entry(context)
                    .or_default()
                    .entry(chars[pos])
                    .or_insert(0) += 1;
            }
        }
    }

    /// Continuation counts for the longest known suffix of `history`.
    fn distribution(&self, history: &[char]) -> Option<&BTreeMap<char, u64>> {
        let max = self.state.order.saturating_sub(1).min(history.len());
        (0..=max).rev().find_map(|len| {
            let context: String = history[history.len() - len..].iter().collect();
            self.state.counts.get(&context)
        })
    }

    fn sample_next(&mut self, history: &[char]) -> Option<(char, f64)> {
        let dist = self.distribution(history)?.clone();
        let total: u64 = dist.values().sum();
        if total == 0 {
            return None;
        }
        let mut draw = self.rng.gen_range(0..total);
        for (&c, &n) in &dist {
            if draw < n {
                return Some((c, n as f64 / total as f64));
            }
            draw -= n;
        }
        None
    }

    /// Complete a password from a (possibly empty) prefix.
    fn complete(&mut self, prefix: &[char]) -> (String, f64) {
        let pad = self.state.order.saturating_sub(1);
        let mut history: Vec<char> = std::iter::repeat(START).take(pad).collect();
        history.extend_from_slice(prefix);
        let mut probability = 1.0;

        while history.len() - pad < self.state.max_length {
            match self.sample_next(&history) {
                Some((END, p)) => {
                    probability *= p;
                    break;
                }
                Some((c, p)) => {
                    probability *= p;
                    history.push(c);
                }
                None => break,
            }
        }

        (history[pad..].iter().collect(), probability)
    }

    fn steered_prefix(&mut self, anchor: &str, sigma: f64) -> Vec<char> {
        let keep = (1.0 - sigma).clamp(0.0, 1.0);
        anchor.chars().take_while(|_| self.rng.gen_bool(keep)).collect()
    }
}

impl Generator for NgramModel {
    fn generate(&mut self, batch_size: usize, steering: Option<&Steering>) -> Result<GeneratedBatch> {
        if self.state.counts.is_empty() {
            return Err(BenchError::model(MODEL_NAME, "generate called before any training"));
        }
        if let Some(s) = steering {
            self.steering = Some(s.clone());
        }

        let mut candidates = Vec::with_capacity(batch_size);
        let mut probabilities = Vec::with_capacity(batch_size);
        let active = self.steering.take();

        for i in 0..batch_size {
            let prefix = match &active {
                Some(s) if !s.anchors.is_empty() => {
                    let anchor = &s.anchors[i % s.anchors.len()];
                    self.steered_prefix(anchor, s.sigma)
                }
                _ => Vec::new(),
            };
            let (password, p) = self.complete(&prefix);
            candidates.push(password);
            probabilities.push(p);
        }

        self.steering = active;
        Ok(GeneratedBatch {
            candidates,
            probabilities: Some(probabilities),
        })
    }

    fn reset_steering(&mut self) {
        self.steering = None;
    }
}

impl PasswordModel for NgramModel {
    fn name(&self) -> &str {
        MODEL_NAME
    }

    fn prepare(&mut self, train: &[String], max_length: usize) -> Result<()> {
        if train.is_empty() {
            return Err(BenchError::model(MODEL_NAME, "empty training set"));
        }
        self.train = train.to_vec();
        self.state.max_length = max_length.max(1);
        Ok(())
    }

    fn train_epoch(&mut self, epoch: usize, total: usize) -> Result<()> {
        let total = total.max(1);
        let shard = self.train.len().div_ceil(total);
        let start = (epoch.saturating_sub(1) * shard).min(self.train.len());
        let end = (start + shard).min(self.train.len());

        let passwords = std::mem::take(&mut self.train);
        for password in &passwords[start..end] {
            self.count(password);
        }
        self.train = passwords;
        self.state.epochs_trained = epoch;
        Ok(())
    }

    fn evaluate(&mut self, test: &HashSet<String>, plan: &EvalPlan, sinks: &mut EvalSinks) -> Result<EvalReport> {
        let report = eval::evaluate_generator(self, test, plan, sinks);
        self.reset_steering();
        report
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.state).map_err(|e| BenchError::model(MODEL_NAME, e))
    }

    fn load_state(&mut self, bytes: &[u8]) -> std::result::Result<(), LoadError> {
        let state: NgramState = bincode::deserialize(bytes).map_err(|e| LoadError::Corrupt(e.to_string()))?;
        if state.order != self.state.order {
            return Err(LoadError::Rejected(format!(
                "checkpoint has order {}, model configured with {}",
                state.order, self.state.order
            )));
        }
        if state.counts.is_empty() {
            return Err(LoadError::Rejected("checkpoint holds an untrained model".into()));
        }
        self.state = state;
        Ok(())
    }
}
