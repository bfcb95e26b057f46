//! Per-run checkpoint state machine.
//!
//! ```text
//! NoCheckpoint ──► Training ──► MidCheckpointed ──► Finalized
//!      ▲                 │            ▲     │
//!      │ load failed     └────────────┘     │ (repeats on every new best)
//!   startup ──► Loaded                      └─ early stop or last epoch
//! ```
//!
//! `Loaded` means a usable checkpoint was found at startup and training is
//! skipped entirely. Load failures are never fatal: the run falls back to
//! training from scratch. Save failures are fatal for the run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::checkpoint::early_stop::ProxyTracker;
use crate::checkpoint::store::CheckpointStore;
use crate::error::{BenchError, LoadError, Result};
use crate::eval::{EvalMode, EvalPlan, EvalSinks};
use crate::model::{ModelSettings, PasswordModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NoCheckpoint,
    Training,
    MidCheckpointed,
    Finalized,
    Loaded,
}

/// How a run wants to start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupRequest {
    pub path_to_checkpoint: Option<PathBuf>,
    pub autoload: bool,
}

/// Summary of a completed training phase.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub epochs_run: usize,
    pub best_proxy_matches: u64,
    pub stopped_early: bool,
    /// Final checkpoint, `None` when no mid checkpoint was ever written
    pub checkpoint: Option<PathBuf>,
}

pub struct CheckpointLifecycle<'a> {
    store: CheckpointStore,
    settings: &'a ModelSettings,
    state: LifecycleState,
    loaded_from: Option<PathBuf>,
}

impl<'a> CheckpointLifecycle<'a> {
    pub fn new(store: CheckpointStore, settings: &'a ModelSettings) -> Self {
        Self {
            store,
            settings,
            state: LifecycleState::NoCheckpoint,
            loaded_from: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Checkpoint restored at startup, if any.
    pub fn loaded_from(&self) -> Option<&Path> {
        self.loaded_from.as_deref()
    }

    /// Try to restore a checkpoint before training. An explicit path wins
    /// over `autoload`. Ends in `Loaded` or `NoCheckpoint`.
    pub fn startup(&mut self, model: &mut dyn PasswordModel, request: &StartupRequest) -> LifecycleState {
        let candidate = if let Some(explicit) = &request.path_to_checkpoint {
            match self.store.import(explicit, self.store.next_id()) {
                Ok(path) => Some(path),
                Err(source) => {
                    log_load_failure(explicit, source);
                    None
                }
            }
        } else if request.autoload {
            let latest = self.store.latest_final().map(|(_, path)| path);
            if latest.is_none() {
                tracing::info!(dir = %self.store.dir().display(), "no final checkpoint to autoload");
            }
            latest
        } else {
            None
        };

        self.state = match candidate {
            Some(path) => match self.restore(model, &path) {
                Ok(id) => {
                    tracing::info!(path = %path.display(), id, "loaded checkpoint");
                    self.loaded_from = Some(path);
                    LifecycleState::Loaded
                }
                Err(source) => {
                    log_load_failure(&path, source);
                    LifecycleState::NoCheckpoint
                }
            },
            None => LifecycleState::NoCheckpoint,
        };
        self.state
    }

    fn restore(&self, model: &mut dyn PasswordModel, path: &Path) -> std::result::Result<u64, LoadError> {
        let checkpoint = self.store.load(path)?;
        model.load_state(&checkpoint.payload)?;
        Ok(checkpoint.id)
    }

    /// Train from scratch with proxy evaluation, mid checkpoints and early
    /// stopping, then finalize. The best checkpointed state is restored into
    /// `model` before returning.
    pub fn train(&mut self, model: &mut dyn PasswordModel, test: &HashSet<String>) -> Result<TrainingOutcome> {
        let total = self.settings.epochs;
        let frequency = self.settings.checkpoint_frequency.max(1);
        let id = self.store.next_id();
        let mut tracker = ProxyTracker::new(self.settings.early_stopping, total);
        let proxy = EvalPlan::new(
            self.settings.proxy_samples,
            self.settings.evaluation_batch_size,
            EvalMode::Sampling,
        );

        self.state = LifecycleState::Training;
        tracing::info!(model = model.name(), epochs = total, id, "training");

        let mut epochs_run = 0;
        let mut stopped_early = false;
        for epoch in 1..=total {
            model.train_epoch(epoch, total)?;
            epochs_run = epoch;
            if epoch % frequency != 0 {
                continue;
            }

            let report = model.evaluate(test, &proxy, &mut EvalSinks::none())?;
            let decision = tracker.observe(epoch, report.matches);
            tracing::debug!(
                epoch,
                proxy_matches = report.matches,
                best = tracker.best(),
                misses = tracker.misses(),
                "proxy evaluation"
            );

            if decision.save_mid {
                let path = self.store.write_mid(id, model.save_state()?)?;
                self.state = LifecycleState::MidCheckpointed;
                tracing::debug!(path = %path.display(), epoch, "mid checkpoint written");
            }
            if decision.stop {
                tracing::info!(epoch, best = tracker.best(), "early stopping");
                stopped_early = true;
                break;
            }
        }

        let checkpoint = self.finalize(model, id)?;
        Ok(TrainingOutcome {
            epochs_run,
            best_proxy_matches: tracker.best(),
            stopped_early,
            checkpoint,
        })
    }

    fn finalize(&mut self, model: &mut dyn PasswordModel, id: u64) -> Result<Option<PathBuf>> {
        self.state = LifecycleState::Finalized;
        let Some(path) = self.store.promote(id)? else {
            tracing::warn!(model = model.name(), "no mid checkpoint written, evaluating the in-memory model");
            return Ok(None);
        };
        tracing::info!(path = %path.display(), "checkpoint finalized");

        self.restore(model, &path).map_err(|source| BenchError::CheckpointLoad {
            path: path.clone(),
            source,
        })?;
        Ok(Some(path))
    }
}

fn log_load_failure(path: &Path, source: LoadError) {
    let err = BenchError::CheckpointLoad {
        path: path.to_path_buf(),
        source,
    };
    tracing::warn!(error = %err, "checkpoint not loaded, training from scratch");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::checkpoint::early_stop::EarlyStoppingConfig;
    use crate::eval::{EvalReport, ThresholdRow};
    use crate::model::{GeneratedBatch, Generator, Steering};
    use tempfile::TempDir;

    /// Reports scripted proxy match counts; its state is the last epoch.
    struct ScriptedModel {
        proxy: Vec<u64>,
        evaluations: usize,
        epoch: usize,
        saves: Mutex<Vec<usize>>,
        loaded: Option<usize>,
    }

    impl ScriptedModel {
        fn new(proxy: Vec<u64>) -> Self {
            Self {
                proxy,
                evaluations: 0,
                epoch: 0,
                saves: Mutex::new(Vec::new()),
                loaded: None,
            }
        }

        fn saved_epochs(&self) -> Vec<usize> {
            self.saves.lock().unwrap().clone()
        }
    }

    impl Generator for ScriptedModel {
        fn generate(&mut self, _batch_size: usize, _steering: Option<&Steering>) -> Result<GeneratedBatch> {
            Ok(GeneratedBatch::default())
        }

        fn reset_steering(&mut self) {}
    }

    impl PasswordModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn prepare(&mut self, _train: &[String], _max_length: usize) -> Result<()> {
            Ok(())
        }

        fn train_epoch(&mut self, epoch: usize, _total: usize) -> Result<()> {
            self.epoch = epoch;
            Ok(())
        }

        fn evaluate(&mut self, test: &HashSet<String>, plan: &EvalPlan, _sinks: &mut EvalSinks) -> Result<EvalReport> {
            let matches = self.proxy[self.evaluations];
            self.evaluations += 1;
            Ok(EvalReport {
                mode: plan.mode,
                test_size: test.len(),
                generated: plan.n_samples,
                matches,
                uniques: None,
                rows: vec![ThresholdRow::new(test.len(), plan.n_samples, matches, None)],
            })
        }

        fn save_state(&self) -> Result<Vec<u8>> {
            self.saves.lock().unwrap().push(self.epoch);
            Ok(vec![self.epoch as u8])
        }

        fn load_state(&mut self, bytes: &[u8]) -> std::result::Result<(), LoadError> {
            match bytes {
                [epoch] => {
                    self.loaded = Some(*epoch as usize);
                    Ok(())
                }
                _ => Err(LoadError::Rejected("expected one byte".into())),
            }
        }
    }

    fn settings(epochs: usize) -> ModelSettings {
        ModelSettings {
            epochs,
            proxy_samples: 100,
            ..ModelSettings::default()
        }
    }

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path(), "scripted", "trainhash").unwrap()
    }

    #[test]
    fn test_mid_checkpoints_on_rising_best() {
        let dir = TempDir::new().unwrap();
        let settings = settings(5);
        let mut lifecycle = CheckpointLifecycle::new(store(&dir), &settings);
        let mut model = ScriptedModel::new(vec![5, 5, 7, 6, 7]);

        let outcome = lifecycle.train(&mut model, &HashSet::new()).unwrap();
        assert_eq!(model.saved_epochs(), vec![1, 3, 5]);
        assert_eq!(outcome.best_proxy_matches, 7);
        assert!(!outcome.stopped_early);
        assert_eq!(lifecycle.state(), LifecycleState::Finalized);

        let final_path = outcome.checkpoint.unwrap();
        assert_eq!(final_path, lifecycle.store().final_path(1));
        assert!(!lifecycle.store().has_mid());
        assert_eq!(model.loaded, Some(5));
    }

    #[test]
    fn test_early_stop_finalizes_best() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(20);
        settings.early_stopping = EarlyStoppingConfig {
            patience: 2,
            start_fraction: 0.5,
            min_relative_margin: 0.05,
        };
        let mut lifecycle = CheckpointLifecycle::new(store(&dir), &settings);
        let mut model = ScriptedModel::new((0..20).map(|i| 20 - i).collect());

        let outcome = lifecycle.train(&mut model, &HashSet::new()).unwrap();
        assert!(outcome.stopped_early);
        assert_eq!(outcome.epochs_run, 11);
        assert_eq!(model.saved_epochs(), vec![1]);
        assert_eq!(model.loaded, Some(1));
    }

    #[test]
    fn test_no_proxy_evaluation_is_degenerate_final() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(2);
        settings.checkpoint_frequency = 5;
        let mut lifecycle = CheckpointLifecycle::new(store(&dir), &settings);
        let mut model = ScriptedModel::new(vec![]);

        let outcome = lifecycle.train(&mut model, &HashSet::new()).unwrap();
        assert_eq!(outcome.checkpoint, None);
        assert_eq!(outcome.epochs_run, 2);
        assert_eq!(lifecycle.state(), LifecycleState::Finalized);
        assert!(lifecycle.store().final_ids().is_empty());
    }

    #[test]
    fn test_autoload_picks_latest_final() {
        let dir = TempDir::new().unwrap();
        let settings = settings(1);
        let mut first = CheckpointLifecycle::new(store(&dir), &settings);
        first.train(&mut ScriptedModel::new(vec![3]), &HashSet::new()).unwrap();
        let mut second = CheckpointLifecycle::new(store(&dir), &settings);
        second.train(&mut ScriptedModel::new(vec![4]), &HashSet::new()).unwrap();
        assert_eq!(store(&dir).final_ids(), vec![1, 2]);

        let mut lifecycle = CheckpointLifecycle::new(store(&dir), &settings);
        let mut model = ScriptedModel::new(vec![]);
        let request = StartupRequest {
            path_to_checkpoint: None,
            autoload: true,
        };
        assert_eq!(lifecycle.startup(&mut model, &request), LifecycleState::Loaded);
        assert_eq!(lifecycle.loaded_from(), Some(store(&dir).final_path(2).as_path()));
    }

    #[test]
    fn test_explicit_path_is_imported_under_fresh_id() {
        let source_dir = TempDir::new().unwrap();
        let settings = settings(1);
        CheckpointLifecycle::new(store(&source_dir), &settings)
            .train(&mut ScriptedModel::new(vec![1]), &HashSet::new())
            .unwrap();
        let external = store(&source_dir).final_path(1);

        let dir = TempDir::new().unwrap();
        let mut lifecycle = CheckpointLifecycle::new(store(&dir), &settings);
        let request = StartupRequest {
            path_to_checkpoint: Some(external),
            autoload: false,
        };
        let mut model = ScriptedModel::new(vec![]);
        assert_eq!(lifecycle.startup(&mut model, &request), LifecycleState::Loaded);
        assert!(store(&dir).final_path(1).is_file());
        assert_eq!(model.loaded, Some(1));
    }

    #[test]
    fn test_missing_or_corrupt_checkpoint_falls_back() {
        let dir = TempDir::new().unwrap();
        let settings = settings(1);
        let mut lifecycle = CheckpointLifecycle::new(store(&dir), &settings);
        let mut model = ScriptedModel::new(vec![]);

        let missing = StartupRequest {
            path_to_checkpoint: Some(dir.path().join("nope.ckpt")),
            autoload: true,
        };
        assert_eq!(lifecycle.startup(&mut model, &missing), LifecycleState::NoCheckpoint);

        std::fs::write(store(&dir).final_path(3), b"garbage").unwrap();
        let autoload = StartupRequest {
            path_to_checkpoint: None,
            autoload: true,
        };
        assert_eq!(lifecycle.startup(&mut model, &autoload), LifecycleState::NoCheckpoint);
        assert!(model.loaded.is_none());
    }
}
