//! Streaming evaluation of guesses against a test set.
//!
//! Everything here is memory-bounded: guesses arrive in batches (from a
//! [`Generator`] or from a chunked file), feed a [`ThresholdEvaluator`], and
//! are optionally appended to gzip files. Only the match set, the optional
//! distinct-candidate set and the top-K heap grow with the input.

pub mod guesses;
pub mod results;
pub mod source;
pub mod threshold;
pub mod topk;

use std::collections::HashSet;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

pub use guesses::{GuessWriter, evaluate_guess_file, fast_eval_thresholds, resolve_guess_file};
pub use results::{ResultRow, ResultsTable};
pub use threshold::{MatchAccumulator, ThresholdEvaluator, ThresholdRow, format_percentage};
pub use topk::{TopK, strip_marker, topk_from_scored_file};

use crate::error::{BenchError, Result};
use crate::model::Generator;
use crate::sampling::{AdaptiveSamplingController, GuidedSamplingParams, RunningMean, SteeringRequest};

/// How a model's generator is driven during evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    /// Plain batches of unsteered samples
    #[default]
    Sampling,
    /// Batches steered by the adaptive controller
    Guided,
    /// Guided, also counting distinct candidates
    GuidedUnique,
    /// Keep the `n_samples` most probable of a larger scored pool
    TopProbability,
}

impl EvalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EvalMode::Sampling => "sampling",
            EvalMode::Guided => "guided",
            EvalMode::GuidedUnique => "guided_unique",
            EvalMode::TopProbability => "top_probability",
        }
    }

    /// Suffix of this mode's guess and match file names.
    pub fn file_suffix(self) -> &'static str {
        match self {
            EvalMode::Sampling => "",
            EvalMode::Guided => "-guided",
            EvalMode::GuidedUnique => "-guided_unique",
            EvalMode::TopProbability => "-most_prob_n_psw",
        }
    }

    pub fn tracks_distinct(self) -> bool {
        self == EvalMode::GuidedUnique
    }
}

impl std::fmt::Display for EvalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to generate and where to report.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalPlan {
    pub n_samples: u64,
    pub batch_size: usize,
    pub mode: EvalMode,
    /// Reporting points; `n_samples` alone when empty
    pub thresholds: Vec<u64>,
    pub guided: GuidedSamplingParams,
    pub top_pool_factor: u64,
    /// Seed of the guided controller's anchor draws
    pub seed: u64,
}

impl EvalPlan {
    pub fn new(n_samples: u64, batch_size: usize, mode: EvalMode) -> Self {
        Self {
            n_samples,
            batch_size: batch_size.max(1),
            mode,
            thresholds: Vec::new(),
            guided: GuidedSamplingParams::for_sample_count(n_samples),
            top_pool_factor: 4,
            seed: 0,
        }
    }

    pub fn with_thresholds(mut self, thresholds: Vec<u64>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn effective_thresholds(&self) -> Vec<u64> {
        if self.thresholds.is_empty() {
            vec![self.n_samples]
        } else {
            self.thresholds.clone()
        }
    }
}

/// Optional gzip outputs of one evaluation.
#[derive(Default)]
pub struct EvalSinks {
    pub guesses: Option<GuessWriter>,
    pub matches: Option<GuessWriter>,
}

impl EvalSinks {
    pub fn none() -> Self {
        Self::default()
    }

    fn write_guesses<S: AsRef<str>>(&mut self, batch: &[S]) -> Result<()> {
        match self.guesses.as_mut() {
            Some(w) => w.write_batch(batch),
            None => Ok(()),
        }
    }

    fn write_matches(&mut self, fresh: &[String]) -> Result<()> {
        match self.matches.as_mut() {
            Some(w) if !fresh.is_empty() => w.write_batch(fresh),
            _ => Ok(()),
        }
    }

    pub fn finish(&mut self) -> Result<()> {
        if let Some(w) = self.guesses.as_mut() {
            w.finish()?;
        }
        if let Some(w) = self.matches.as_mut() {
            w.finish()?;
        }
        Ok(())
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub mode: EvalMode,
    pub test_size: usize,
    /// Candidates consumed by threshold evaluation
    pub generated: u64,
    pub matches: u64,
    pub uniques: Option<u64>,
    pub rows: Vec<ThresholdRow>,
}

impl EvalReport {
    pub fn from_accumulator(mode: EvalMode, test_size: usize, rows: Vec<ThresholdRow>, acc: &MatchAccumulator) -> Self {
        Self {
            mode,
            test_size,
            generated: acc.observed(),
            matches: acc.match_count(),
            uniques: acc.distinct_count(),
            rows,
        }
    }

    pub fn match_percentage(&self) -> String {
        format_percentage(self.matches, self.test_size)
    }
}

/// Feed candidates to the evaluator, stripping guess markers when present.
fn feed_stripped<S: AsRef<str>>(evaluator: &mut ThresholdEvaluator<'_>, batch: &[S]) -> Vec<String> {
    if batch.iter().any(|c| c.as_ref().contains(topk::GUESS_MARKER)) {
        evaluator.feed(batch.iter().map(|c| strip_marker(c.as_ref())))
    } else {
        evaluator.feed(batch)
    }
}

/// Batch sizes covering `n` candidates.
fn batch_sizes(n: u64, batch_size: usize) -> impl Iterator<Item = usize> {
    let batch = batch_size.max(1) as u64;
    let full = n / batch;
    let rest = n % batch;
    (0..full)
        .map(move |_| batch as usize)
        .chain((rest > 0).then_some(rest as usize))
}

/// Drive a generator through one evaluation.
pub fn evaluate_generator<G: Generator + ?Sized>(
    generator: &mut G,
    test: &HashSet<String>,
    plan: &EvalPlan,
    sinks: &mut EvalSinks,
) -> Result<EvalReport> {
    let report = match plan.mode {
        EvalMode::Sampling | EvalMode::Guided | EvalMode::GuidedUnique => sample(generator, test, plan, sinks)?,
        EvalMode::TopProbability => top_probability(generator, test, plan, sinks)?,
    };
    sinks.finish()?;
    tracing::info!(
        mode = %plan.mode,
        generated = report.generated,
        matches = report.matches,
        percentage = %report.match_percentage(),
        "evaluation finished"
    );
    Ok(report)
}

fn sample<G: Generator + ?Sized>(
    generator: &mut G,
    test: &HashSet<String>,
    plan: &EvalPlan,
    sinks: &mut EvalSinks,
) -> Result<EvalReport> {
    let thresholds = plan.effective_thresholds();
    let mut evaluator = ThresholdEvaluator::new(test, &thresholds, plan.mode.tracks_distinct());
    let mut controller = (plan.mode != EvalMode::Sampling)
        .then(|| AdaptiveSamplingController::new(plan.guided, StdRng::seed_from_u64(plan.seed)));
    let mut novel = RunningMean::default();

    for size in batch_sizes(plan.n_samples, plan.batch_size) {
        if evaluator.is_done() {
            break;
        }

        let batch = match controller.as_mut().map(|c| c.next_request(size)) {
            Some(SteeringRequest::Steered(steering)) => generator.generate(size, Some(&steering))?,
            Some(SteeringRequest::Unsteered) => {
                generator.reset_steering();
                generator.generate(size, None)?
            }
            None => generator.generate(size, None)?,
        };
        if batch.candidates.is_empty() {
            tracing::warn!("generator returned an empty batch, stopping evaluation");
            break;
        }

        sinks.write_guesses(&batch.candidates)?;
        let fresh = feed_stripped(&mut evaluator, &batch.candidates);
        sinks.write_matches(&fresh)?;

        if let Some(c) = controller.as_mut() {
            let mean = novel.push(fresh.len() as u64);
            tracing::trace!(novel = fresh.len(), running_mean = mean, steering = c.is_steering(), "guided batch");
            c.record_matches(fresh);
        }
    }

    generator.reset_steering();
    let (rows, acc) = evaluator.finish();
    Ok(EvalReport::from_accumulator(plan.mode, test.len(), rows, &acc))
}

fn top_probability<G: Generator + ?Sized>(
    generator: &mut G,
    test: &HashSet<String>,
    plan: &EvalPlan,
    sinks: &mut EvalSinks,
) -> Result<EvalReport> {
    let k = usize::try_from(plan.n_samples)
        .map_err(|_| BenchError::config(format!("n_samples {} too large for top-k selection", plan.n_samples)))?;
    let pool = plan.n_samples.saturating_mul(plan.top_pool_factor.max(1));
    let mut top = TopK::new(k);

    generator.reset_steering();
    for size in batch_sizes(pool, plan.batch_size) {
        let batch = generator.generate(size, None)?;
        let Some(probabilities) = batch.probabilities else {
            return Err(BenchError::Model {
                model: "generator".into(),
                reason: "top-probability evaluation needs candidate probabilities".into(),
            });
        };
        if batch.candidates.is_empty() {
            break;
        }
        for (candidate, p) in batch.candidates.into_iter().zip(probabilities) {
            top.push(strip_marker(&candidate), p);
        }
    }
    tracing::debug!(pool, kept = top.len(), min_probability = ?top.min_probability(), "top-k selected");

    let thresholds = plan.effective_thresholds();
    let mut evaluator = ThresholdEvaluator::new(test, &thresholds, plan.mode.tracks_distinct());
    let ranked: Vec<String> = top.into_sorted_vec().into_iter().map(|s| s.password).collect();
    for chunk in ranked.chunks(plan.batch_size.max(1)) {
        sinks.write_guesses(chunk)?;
        let fresh = evaluator.feed(chunk);
        sinks.write_matches(&fresh)?;
    }

    let (rows, acc) = evaluator.finish();
    Ok(EvalReport::from_accumulator(plan.mode, test.len(), rows, &acc))
}
