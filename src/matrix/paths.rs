//! Output layout for runs.
//!
//! ```text
//! results/<scenario>/output.csv
//! results/<scenario>/<model>/<train_datasets>/<test-args>/<n_samples>/<train-hash>/
//!     guesses/   matches/   run.json
//! ```
//!
//! `test-args` joins every remaining parameter value, sorted by key, with `-`.
//! Well-known character bags are abbreviated so directory names stay short.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::types::{ParamValue, RunSpec};

pub const CHAR_BAG_ALL: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789~!@#$%^&*(),.<>/?'\"{}[]\\|-_=+;: `";
pub const CHAR_BAG_CHARS_NUMBERS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const CHAR_BAG_CHARS_SYMBOLS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ~!@#$%^&*(),.<>/?'\"{}[]\\|-_=+;: `";
pub const CHAR_BAG_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const CHAR_BAG_NUMBERS: &str = "0123456789";

static CHAR_BAG_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (CHAR_BAG_ALL, "all"),
        (CHAR_BAG_CHARS_NUMBERS, "c+n"),
        (CHAR_BAG_CHARS_SYMBOLS, "c+s"),
        (CHAR_BAG_CHARS, "c"),
        (CHAR_BAG_NUMBERS, "n"),
    ])
});

/// Parameters that never appear in the test-args component.
const PATH_SKIP: &[&str] = &[
    "autoload",
    "display_logs",
    "models",
    "test_reference",
    "train_datasets",
    "n_samples",
    "use_existing_samples",
    "path_to_checkpoint",
];

/// Parameters a reference scenario inherits from the run being evaluated.
const REFERENCE_KEEP: &[&str] = &[
    "train_datasets",
    "models",
    "n_samples",
    "test_datasets",
    "train_split_percentage",
    "train_chunk_percentage",
];

/// Abbreviation for a character bag, or the bag itself.
pub fn char_bag_alias(bag: &str) -> &str {
    CHAR_BAG_ALIASES.get(bag).copied().unwrap_or(bag)
}

/// The `test-args` path component.
pub fn test_args(spec: &RunSpec) -> String {
    spec.iter()
        .filter(|(name, _, _)| !PATH_SKIP.contains(name))
        .map(|(name, _, value)| match (name, value) {
            ("char_bag", ParamValue::Text(bag)) => char_bag_alias(bag).to_string(),
            _ => value.to_string(),
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Output directory shared by every train identity of this configuration.
pub fn output_dir(results_root: &Path, spec: &RunSpec, model: &str) -> PathBuf {
    let datasets = spec.text("train_datasets").unwrap_or_default();
    let n_samples = spec.text("n_samples").unwrap_or_default();
    results_root
        .join(&spec.scenario)
        .join(model)
        .join(datasets)
        .join(test_args(spec))
        .join(n_samples)
}

/// Directory of one run: the output directory keyed by the train identity.
pub fn run_dir(results_root: &Path, spec: &RunSpec, model: &str, train_hash: &str) -> PathBuf {
    output_dir(results_root, spec, model).join(train_hash)
}

/// Aggregate results table of a scenario.
pub fn results_table(results_root: &Path, scenario: &str) -> PathBuf {
    results_root.join(scenario).join("output.csv")
}

/// Guess directory of an earlier run of the same configuration with a
/// different sample count.
pub fn existing_samples_dir(
    results_root: &Path,
    spec: &RunSpec,
    model: &str,
    train_hash: &str,
    n_samples: &ParamValue,
) -> PathBuf {
    let mut earlier = spec.clone();
    let group = spec.group_of("n_samples").unwrap_or(crate::types::ParamGroup::General);
    earlier.insert("n_samples", group, n_samples.clone());
    run_dir(results_root, &earlier, model, train_hash).join("guesses")
}

/// Guess directory produced by a reference scenario for the same model and
/// training data.
///
/// The reference configuration keeps the run's dataset and sampling
/// parameters, drops everything the reference scenario does not declare, and
/// takes the reference scenario's own values for the rest.
pub fn reference_guesses_dir(
    results_root: &Path,
    spec: &RunSpec,
    reference: &RunSpec,
    model: &str,
    train_hash: &str,
) -> PathBuf {
    let mut derived = RunSpec::new(reference.scenario.clone());
    for (name, group, value) in spec.iter() {
        if reference.contains(name) || REFERENCE_KEEP.contains(&name) {
            derived.insert(name, group, value.clone());
        }
    }
    for (name, group, value) in reference.iter() {
        derived.insert(name, group, value.clone());
    }
    run_dir(results_root, &derived, model, train_hash).join("guesses")
}
