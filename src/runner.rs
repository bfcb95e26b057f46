//! Run orchestration.
//!
//! A [`Runner`] turns scenarios into [`RunContext`]s (all validation happens
//! here, before anything executes), then drives each run through split
//! loading, the checkpoint lifecycle and evaluation. Independent runs share a
//! rayon pool; runs with the same model and training hash serialize on their
//! checkpoint directory.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, info_span, warn};

use crate::cache::{self, DatasetCatalog, DatasetSplit, Pipeline, SplitCache};
use crate::checkpoint::{CheckpointLifecycle, CheckpointStore, LifecycleState, StartupRequest};
use crate::config::{Override, PathsConfig, Scenario, Settings, build_matrix};
use crate::error::{BenchError, Result};
use crate::eval::guesses::{GUESSES_DIR, MATCHES_DIR, prepare_output_dir, subsample, write_passwords};
use crate::eval::{
    EvalPlan, EvalReport, EvalSinks, GuessWriter, ResultRow, ResultsTable, evaluate_guess_file,
    fast_eval_thresholds, resolve_guess_file,
};
use crate::matrix::{HashedIdentity, IdentityScope, expand, paths};
use crate::model::{ModelRegistry, ModelSettings};
use crate::types::{ParamGroup, ParamValue, RunSpec};

/// Length bound used when a run sets no `max_length`.
pub const DEFAULT_MAX_LENGTH: usize = 32;

pub const MANIFEST_FILE: &str = "run.json";

/// Process-wide settings, built once and passed down.
pub struct ExecutionContext {
    pub paths: PathsConfig,
    pub parallel_runs: usize,
    pub display_logs: bool,
    pub device: String,
    pub registry: ModelRegistry,
    models: BTreeMap<String, ModelSettings>,
}

impl ExecutionContext {
    pub fn new(settings: &Settings, registry: ModelRegistry) -> Self {
        Self {
            paths: settings.paths.clone(),
            parallel_runs: settings.execution.parallel_runs.max(1),
            display_logs: settings.execution.display_logs,
            device: settings.execution.device.clone(),
            registry,
            models: settings.models.clone(),
        }
    }

    pub fn model_settings(&self, model: &str) -> ModelSettings {
        self.models.get(model).cloned().unwrap_or_default()
    }
}

/// Where a fast evaluation reads its guesses from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastEvalSource {
    /// Guess directory of a reference run
    Reference(PathBuf),
    /// Guess directory of an earlier run, cut down to `n_samples` lines
    ExistingSamples { dir: PathBuf, n_samples: u64 },
}

/// Everything one run needs, resolved up front.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub spec: RunSpec,
    pub model: String,
    pub settings: ModelSettings,
    pub pipeline: Pipeline,
    pub train_id: HashedIdentity,
    pub test_id: HashedIdentity,
    pub n_samples: u64,
    pub max_length: usize,
    pub run_dir: PathBuf,
    pub startup: StartupRequest,
    pub fast_eval: Option<FastEvalSource>,
}

impl RunContext {
    pub fn new(ctx: &ExecutionContext, spec: RunSpec, pipeline: Pipeline) -> Result<Self> {
        let model = spec.require_text("models")?;
        if !ctx.registry.contains(&model) {
            let known: Vec<&str> = ctx.registry.names().collect();
            return Err(BenchError::config(format!(
                "unknown model '{}' (known: {})",
                model,
                known.join(", ")
            )));
        }
        pipeline.validate(&spec)?;

        let n_samples = spec.require_i64("n_samples")?;
        if n_samples <= 0 {
            return Err(BenchError::config(format!("n_samples must be positive, got {}", n_samples)));
        }
        let max_length = match spec.get("max_length") {
            Some(value) => match value.as_i64() {
                Some(n) if n > 0 => n as usize,
                _ => return Err(BenchError::config(format!("max_length must be a positive integer, got {}", value))),
            },
            None => DEFAULT_MAX_LENGTH,
        };

        let train_id = HashedIdentity::derive(&spec, IdentityScope::Train);
        let test_id = HashedIdentity::derive(&spec, IdentityScope::Test);
        let run_dir = paths::run_dir(&ctx.paths.results, &spec, &model, train_id.as_str());

        let startup = StartupRequest {
            path_to_checkpoint: enabled_text(&spec, "path_to_checkpoint").map(PathBuf::from),
            autoload: spec.is_set("autoload"),
        };

        let fast_eval = resolve_fast_eval(ctx, &spec, &model, &train_id, n_samples as u64)?;

        Ok(Self {
            settings: ctx.model_settings(&model),
            spec,
            model,
            pipeline,
            train_id,
            test_id,
            n_samples: n_samples as u64,
            max_length,
            run_dir,
            startup,
            fast_eval,
        })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join(MANIFEST_FILE)
    }

    fn plan(&self) -> EvalPlan {
        let mut plan = EvalPlan::new(self.n_samples, self.settings.evaluation_batch_size, self.settings.mode)
            .with_thresholds(fast_eval_thresholds(self.n_samples));
        plan.top_pool_factor = self.settings.top_pool_factor.max(1);
        plan.seed = self.settings.extra_i64("seed").unwrap_or(0) as u64;
        plan
    }
}

/// `test_reference` wins over `use_existing_samples` when both are set.
fn resolve_fast_eval(
    ctx: &ExecutionContext,
    spec: &RunSpec,
    model: &str,
    train_id: &HashedIdentity,
    n_samples: u64,
) -> Result<Option<FastEvalSource>> {
    let results = &ctx.paths.results;

    if let Some(reference) = enabled_text(spec, "test_reference") {
        let dir = if reference.ends_with(".toml") {
            let scenarios = Scenario::load_file(Path::new(&reference))?;
            let first = scenarios
                .first()
                .ok_or_else(|| BenchError::config(format!("reference file {} declares no scenario", reference)))?;
            paths::reference_guesses_dir(results, spec, &first.reference_spec(), model, train_id.as_str())
        } else {
            PathBuf::from(reference)
        };
        return Ok(Some(FastEvalSource::Reference(dir)));
    }

    match spec.get("use_existing_samples") {
        Some(ParamValue::Bool(false)) | None => Ok(None),
        Some(earlier) => {
            if earlier.as_i64().is_none_or(|n| n <= 0) {
                return Err(BenchError::config(format!(
                    "use_existing_samples must name an earlier sample count, got {}",
                    earlier
                )));
            }
            Ok(Some(FastEvalSource::ExistingSamples {
                dir: paths::existing_samples_dir(results, spec, model, train_id.as_str(), earlier),
                n_samples,
            }))
        }
    }
}

/// Text of a parameter that may also be switched off with `false`.
fn enabled_text(spec: &RunSpec, name: &str) -> Option<String> {
    match spec.get(name)? {
        ParamValue::Text(s) => {
            let off = matches!(s.trim().to_ascii_lowercase().as_str(), "" | "false" | "no" | "none");
            (!off).then(|| s.clone())
        }
        _ => None,
    }
}

/// How a run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed {
        report: EvalReport,
        fast_eval: bool,
        /// Checkpoint the evaluated state came from
        checkpoint: Option<PathBuf>,
    },
    Failed {
        error: String,
    },
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub scenario: String,
    pub model: String,
    pub train_hash: HashedIdentity,
    pub test_hash: HashedIdentity,
    pub run_dir: PathBuf,
    #[serde(flatten)]
    pub status: RunStatus,
}

impl RunRecord {
    fn new(run: &RunContext, status: RunStatus) -> Self {
        Self {
            scenario: run.spec.scenario.clone(),
            model: run.model.clone(),
            train_hash: run.train_id.clone(),
            test_hash: run.test_id.clone(),
            run_dir: run.run_dir.clone(),
            status,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed { .. })
    }
}

#[derive(Serialize)]
struct RunManifest<'a> {
    spec: &'a RunSpec,
    #[serde(flatten)]
    record: &'a RunRecord,
}

struct RunOutput {
    report: EvalReport,
    checkpoint: Option<PathBuf>,
}

pub struct Runner<'a> {
    ctx: &'a ExecutionContext,
    catalog: DatasetCatalog,
    cache: SplitCache,
    checkpoint_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl<'a> Runner<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Result<Self> {
        Ok(Self {
            ctx,
            catalog: DatasetCatalog::scan(&ctx.paths.datasets)?,
            cache: SplitCache::open(&ctx.paths.cache)?,
            checkpoint_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> &SplitCache {
        &self.cache
    }

    /// Expand every scenario into validated runs.
    pub fn plan(&self, settings: &Settings, scenarios: &[Scenario], overrides: &[Override]) -> Result<Vec<RunContext>> {
        let mut runs = Vec::new();
        for scenario in scenarios {
            let mut matrix = build_matrix(settings, scenario, overrides)?;
            if matrix.values("train_datasets").is_none() {
                let names = self.catalog.names();
                if names.is_empty() {
                    return Err(BenchError::config(format!(
                        "no datasets found under {}",
                        self.catalog.root().display()
                    )));
                }
                let values = names.into_iter().map(ParamValue::Text).collect();
                matrix.declare(ParamGroup::PreSplit, "train_datasets", values)?;
            }

            let specs = expand(&matrix)?;
            info!(scenario = %scenario.name, runs = specs.len(), "expanded scenario");
            for spec in specs {
                runs.push(RunContext::new(self.ctx, spec, scenario.pipeline())?);
            }
        }
        Ok(runs)
    }

    /// Execute runs on a pool of `parallel_runs` threads.
    ///
    /// Run-local failures are recorded and siblings continue. A failure of
    /// shared infrastructure skips every run not yet started and is returned.
    pub fn run_all(&self, runs: &[RunContext]) -> Result<Vec<RunRecord>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.ctx.parallel_runs)
            .build()
            .map_err(|e| BenchError::config(format!("cannot build run pool: {}", e)))?;
        let abort = AtomicBool::new(false);

        let outcomes: Vec<(RunRecord, Option<BenchError>)> = pool.install(|| {
            runs.par_iter()
                .map(|run| {
                    if abort.load(Ordering::SeqCst) {
                        return (RunRecord::new(run, RunStatus::Skipped), None);
                    }
                    match self.run_one(run) {
                        Ok(record) => (record, None),
                        Err(err) => {
                            error!(
                                model = %run.model,
                                test_hash = %run.test_id,
                                run_dir = %run.run_dir.display(),
                                error = %err,
                                "run failed"
                            );
                            let record = RunRecord::new(run, RunStatus::Failed { error: err.to_string() });
                            self.write_manifest(run, &record);
                            if err.is_fatal_for_invocation() {
                                abort.store(true, Ordering::SeqCst);
                                (record, Some(err))
                            } else {
                                (record, None)
                            }
                        }
                    }
                })
                .collect()
        });

        let mut records = Vec::with_capacity(outcomes.len());
        let mut fatal = None;
        for (record, err) in outcomes {
            if fatal.is_none() {
                fatal = err;
            }
            records.push(record);
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(records),
        }
    }

    /// Execute a single run and write its manifest.
    pub fn run_one(&self, run: &RunContext) -> Result<RunRecord> {
        let span = info_span!("run", model = %run.model, test_hash = %run.test_id.short());
        let _enter = span.enter();

        let split = self.load_split(run)?;
        info!(train = split.train.len(), test = split.test_size(), device = %self.ctx.device, "split ready");

        let (output, fast_eval) = match &run.fast_eval {
            Some(source) => (self.evaluate_existing(run, source, &split)?, true),
            None => (self.train_and_evaluate(run, &split)?, false),
        };
        self.record_results(run, &output.report)?;

        let record = RunRecord::new(
            run,
            RunStatus::Completed {
                report: output.report,
                fast_eval,
                checkpoint: output.checkpoint,
            },
        );
        self.write_manifest(run, &record);
        Ok(record)
    }

    fn load_split(&self, run: &RunContext) -> Result<DatasetSplit> {
        self.cache.get_or_build(&run.test_id, || {
            let raw = cache::load_raw(&self.catalog, &run.spec)?;
            run.pipeline.run(raw, &run.spec)
        })
    }

    fn evaluate_existing(&self, run: &RunContext, source: &FastEvalSource, split: &DatasetSplit) -> Result<RunOutput> {
        let mode = run.settings.mode;
        let suffix = mode.file_suffix();

        let guesses = match source {
            FastEvalSource::Reference(dir) => find_guesses(dir, suffix)?,
            FastEvalSource::ExistingSamples { dir, n_samples } => {
                let earlier = find_guesses(dir, suffix)?;
                let dst = run.run_dir.join(GUESSES_DIR).join(format!("sub-sampled{}.gz", suffix));
                let written = subsample(&earlier, *n_samples, &dst)?;
                if written < *n_samples {
                    warn!(source = %earlier.display(), written, requested = n_samples, "earlier run has fewer guesses");
                }
                dst
            }
        };
        info!(guesses = %guesses.display(), "evaluating existing guesses");

        let thresholds = fast_eval_thresholds(run.n_samples);
        let (rows, acc) = evaluate_guess_file(&guesses, &split.test, &thresholds, mode.tracks_distinct())?;

        if run.settings.save_matches {
            let dir = run.run_dir.join(MATCHES_DIR);
            prepare_output_dir(&dir)?;
            write_passwords(&dir.join(format!("matches{}.gz", suffix)), acc.matches())?;
        }

        Ok(RunOutput {
            report: EvalReport::from_accumulator(mode, split.test_size(), rows, &acc),
            checkpoint: None,
        })
    }

    fn train_and_evaluate(&self, run: &RunContext, split: &DatasetSplit) -> Result<RunOutput> {
        let mut model = self.ctx.registry.create(&run.model, &run.settings)?;
        model.prepare(&split.train, run.max_length)?;

        let store = CheckpointStore::open(&self.ctx.paths.checkpoints, &run.model, run.train_id.as_str())?;
        let lock = self.checkpoint_lock(store.dir());
        let checkpoint = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut lifecycle = CheckpointLifecycle::new(store, &run.settings);
            match lifecycle.startup(model.as_mut(), &run.startup) {
                LifecycleState::NoCheckpoint => {
                    let outcome = lifecycle.train(model.as_mut(), &split.test)?;
                    info!(
                        epochs = outcome.epochs_run,
                        best_proxy = outcome.best_proxy_matches,
                        stopped_early = outcome.stopped_early,
                        "training finished"
                    );
                    outcome.checkpoint
                }
                _ => lifecycle.loaded_from().map(Path::to_path_buf),
            }
        };

        let mut sinks = self.open_sinks(run)?;
        let report = model.evaluate(&split.test, &run.plan(), &mut sinks)?;
        Ok(RunOutput { report, checkpoint })
    }

    fn open_sinks(&self, run: &RunContext) -> Result<EvalSinks> {
        let suffix = run.settings.mode.file_suffix();
        let open = |enabled: bool, dir_name: &str, stem: &str| -> Result<Option<GuessWriter>> {
            if !enabled {
                return Ok(None);
            }
            let dir = run.run_dir.join(dir_name);
            prepare_output_dir(&dir)?;
            GuessWriter::append(&dir.join(format!("{}{}.gz", stem, suffix))).map(Some)
        };
        Ok(EvalSinks {
            guesses: open(run.settings.save_guesses, GUESSES_DIR, "guesses")?,
            matches: open(run.settings.save_matches, MATCHES_DIR, "matches")?,
        })
    }

    fn checkpoint_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.checkpoint_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(dir.to_path_buf()).or_default())
    }

    fn record_results(&self, run: &RunContext, report: &EvalReport) -> Result<()> {
        let table = ResultsTable::new(paths::results_table(&self.ctx.paths.results, &run.spec.scenario));
        let train_dataset = run.spec.text("train_datasets").unwrap_or_default();
        let test_settings = paths::test_args(&run.spec);
        let rows: Vec<ResultRow> = report
            .rows
            .iter()
            .map(|row| ResultRow {
                model: run.model.clone(),
                train_dataset: train_dataset.clone(),
                test_settings: test_settings.clone(),
                test_hash: run.test_id.to_string(),
                row: row.clone(),
            })
            .collect();
        table.append(&rows)
    }

    /// A manifest that cannot be written is logged, never fatal.
    fn write_manifest(&self, run: &RunContext, record: &RunRecord) {
        let manifest = RunManifest { spec: &run.spec, record };
        let path = run.manifest_path();
        let written = serde_json::to_vec_pretty(&manifest)
            .map_err(std::io::Error::other)
            .and_then(|bytes| write_atomic(&path, &bytes));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "failed to write run manifest");
        }
    }
}

fn find_guesses(dir: &Path, suffix: &str) -> Result<PathBuf> {
    resolve_guess_file(dir, suffix)?
        .ok_or_else(|| BenchError::stream(dir, format!("no guesses{}.gz or matching guess file", suffix)))
}

/// Write through a synced temp file and rename into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)
}
