//! Model capability interface and registry.
//!
//! The harness never looks inside a model. It trains it epoch by epoch,
//! asks it for opaque state to checkpoint, and drives its [`Generator`]
//! during evaluation. Concrete models register a constructor under a name;
//! the `models` parameter of a run selects one.

pub mod ngram;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::checkpoint::EarlyStoppingConfig;
use crate::error::{BenchError, LoadError, Result};
use crate::eval::{EvalMode, EvalPlan, EvalReport, EvalSinks};

/// Steer generation towards previously matched passwords.
#[derive(Debug, Clone, PartialEq)]
pub struct Steering {
    /// One anchor per requested candidate (drawn with replacement)
    pub anchors: Vec<String>,
    /// Spread around each anchor
    pub sigma: f64,
}

/// One batch of candidates, with per-candidate probabilities when the
/// model can score its own output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedBatch {
    pub candidates: Vec<String>,
    pub probabilities: Option<Vec<f64>>,
}

/// Anything that produces candidate passwords in batches.
pub trait Generator {
    fn generate(&mut self, batch_size: usize, steering: Option<&Steering>) -> Result<GeneratedBatch>;

    /// Return to unsteered generation.
    fn reset_steering(&mut self);
}

/// Per-model settings from `[models.<name>]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub epochs: usize,
    /// Proxy-evaluate every this many epochs
    pub checkpoint_frequency: usize,
    pub evaluation_batch_size: usize,
    pub mode: EvalMode,
    pub save_guesses: bool,
    pub save_matches: bool,
    /// Sample budget of the proxy evaluation during training
    pub proxy_samples: u64,
    /// Top-probability mode scores this many candidates per retained guess
    pub top_pool_factor: u64,
    pub early_stopping: EarlyStoppingConfig,
    /// Model-specific keys
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            epochs: 10,
            checkpoint_frequency: 1,
            evaluation_batch_size: 10_000,
            mode: EvalMode::Sampling,
            save_guesses: true,
            save_matches: true,
            proxy_samples: 1_000_000,
            top_pool_factor: 4,
            early_stopping: EarlyStoppingConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl ModelSettings {
    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(|v| v.as_integer())
    }
}

/// A trainable password model.
pub trait PasswordModel: Generator + Send {
    fn name(&self) -> &str;

    /// Receive the training passwords and the run's length bound.
    fn prepare(&mut self, train: &[String], max_length: usize) -> Result<()>;

    /// Train one epoch (1-based) of `total`.
    fn train_epoch(&mut self, epoch: usize, total: usize) -> Result<()>;

    /// Drive this model's generator against a test set.
    fn evaluate(&mut self, test: &HashSet<String>, plan: &EvalPlan, sinks: &mut EvalSinks) -> Result<EvalReport>;

    fn save_state(&self) -> Result<Vec<u8>>;

    fn load_state(&mut self, bytes: &[u8]) -> std::result::Result<(), LoadError>;
}

pub type ModelConstructor = fn(&ModelSettings) -> Result<Box<dyn PasswordModel>>;

/// Name → constructor.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    constructors: BTreeMap<String, ModelConstructor>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every model shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ngram::MODEL_NAME, ngram::construct);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: ModelConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str, settings: &ModelSettings) -> Result<Box<dyn PasswordModel>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| BenchError::config(format!("model '{}' is not registered", name)))?;
        constructor(settings)
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = ModelRegistry::builtin();
        assert!(registry.contains("ngram"));
        assert!(!registry.contains("PassGPT"));

        let model = registry.create("ngram", &ModelSettings::default()).unwrap();
        assert_eq!(model.name(), "ngram");

        let err = registry.create("PassGPT", &ModelSettings::default()).err().unwrap();
        assert!(matches!(err, BenchError::Configuration(_)));
    }

    #[test]
    fn test_settings_parse_with_extras() {
        let settings: ModelSettings = toml::from_str(
            r#"
            epochs = 4
            mode = "guided"
            order = 5
            [early_stopping]
            patience = 3
            start_fraction = 0.25
            min_relative_margin = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(settings.epochs, 4);
        assert_eq!(settings.mode, EvalMode::Guided);
        assert_eq!(settings.extra_i64("order"), Some(5));
        assert_eq!(settings.early_stopping.patience, 3);
        assert_eq!(settings.checkpoint_frequency, 1);
    }
}
