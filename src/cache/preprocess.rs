//! Dataset preprocessing steps.
//!
//! A scenario declares an ordered list of steps. Each step receives the full
//! run parameters but only reads its own keys, and transforms the pair of
//! password lists. Train passwords keep their order and duplicates. Test
//! passwords are collapsed into a set only once the pipeline finishes.
//!
//! Cross-dataset runs start with a non-empty test list loaded from
//! `test_datasets`. The split steps still compute a train portion, but always
//! restore the explicitly loaded test list afterwards.

use std::collections::{HashMap, HashSet};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::cache::store::DatasetSplit;
use crate::error::{BenchError, Result};
use crate::types::RunSpec;

/// Seed for every randomised step, so rebuilding a split reproduces it.
pub const PREPROCESS_SEED: u64 = 42;

/// Working pair of password lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PasswordLists {
    pub train: Vec<String>,
    pub test: Vec<String>,
}

impl PasswordLists {
    pub fn new(train: Vec<String>, test: Vec<String>) -> Self {
        Self { train, test }
    }

    pub fn into_split(self) -> DatasetSplit {
        DatasetSplit {
            train: self.train,
            test: self.test.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreprocessStep {
    FilterByLength,
    FilterByCharBag,
    StandardSplit,
    TestCentricSplit,
    FilterByFrequency,
    ChunkTrainDataset,
}

impl PreprocessStep {
    pub const ALL: [PreprocessStep; 6] = [
        PreprocessStep::FilterByLength,
        PreprocessStep::FilterByCharBag,
        PreprocessStep::StandardSplit,
        PreprocessStep::TestCentricSplit,
        PreprocessStep::FilterByFrequency,
        PreprocessStep::ChunkTrainDataset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PreprocessStep::FilterByLength => "filter_by_length",
            PreprocessStep::FilterByCharBag => "filter_by_char_bag",
            PreprocessStep::StandardSplit => "standard_split",
            PreprocessStep::TestCentricSplit => "test_centric_split",
            PreprocessStep::FilterByFrequency => "filter_by_frequency",
            PreprocessStep::ChunkTrainDataset => "chunk_train_dataset",
        }
    }

    /// Look a step up by name. A module prefix such as
    /// `standard_preprocessing.filter_by_length` is accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        let bare = name.rsplit('.').next().unwrap_or(name).trim();
        Self::ALL.into_iter().find(|s| s.name() == bare)
    }

    /// Parameters the step reads from the run.
    pub fn required_keys(self) -> &'static [&'static str] {
        match self {
            PreprocessStep::FilterByLength => &["max_length"],
            PreprocessStep::FilterByCharBag => &["char_bag"],
            PreprocessStep::StandardSplit | PreprocessStep::TestCentricSplit => &["train_split_percentage"],
            PreprocessStep::FilterByFrequency => &["test_frequency"],
            PreprocessStep::ChunkTrainDataset => &["train_chunk_percentage"],
        }
    }

    pub fn apply(self, lists: PasswordLists, spec: &RunSpec, rng: &mut StdRng) -> Result<PasswordLists> {
        match self {
            PreprocessStep::FilterByLength => filter_by_length(lists, spec.require_i64("max_length")?),
            PreprocessStep::FilterByCharBag => Ok(filter_by_char_bag(lists, &spec.require_text("char_bag")?)),
            PreprocessStep::StandardSplit => standard_split(lists, spec.require_i64("train_split_percentage")?),
            PreprocessStep::TestCentricSplit => {
                test_centric_split(lists, spec.require_i64("train_split_percentage")?, rng)
            }
            PreprocessStep::FilterByFrequency => filter_by_frequency(lists, spec.require_i64("test_frequency")?),
            PreprocessStep::ChunkTrainDataset => {
                chunk_train_dataset(lists, spec.require_i64("train_chunk_percentage")?)
            }
        }
    }
}

/// Ordered steps of one scenario.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    steps: Vec<PreprocessStep>,
}

impl Pipeline {
    pub fn new(steps: Vec<PreprocessStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[PreprocessStep] {
        &self.steps
    }

    /// Every key a step needs must be present in the run.
    pub fn validate(&self, spec: &RunSpec) -> Result<()> {
        for step in &self.steps {
            for key in step.required_keys() {
                if !spec.contains(key) {
                    return Err(BenchError::config(format!(
                        "scenario '{}': step {} requires parameter '{}'",
                        spec.scenario,
                        step.name(),
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn run(&self, lists: PasswordLists, spec: &RunSpec) -> Result<DatasetSplit> {
        let mut rng = StdRng::seed_from_u64(PREPROCESS_SEED);
        let mut lists = lists;
        for step in &self.steps {
            lists = step.apply(lists, spec, &mut rng)?;
            tracing::debug!(
                step = step.name(),
                train = lists.train.len(),
                test = lists.test.len(),
                "applied preprocessing step"
            );
        }
        Ok(lists.into_split())
    }
}

fn percentage_split(train: Vec<String>, percentage: i64) -> Result<(Vec<String>, Vec<String>)> {
    if !(1..=100).contains(&percentage) {
        return Err(BenchError::config(format!(
            "train_split_percentage must be in (0, 100], got {}",
            percentage
        )));
    }
    let at = (train.len() as u128 * percentage as u128 / 100) as usize;
    let mut train = train;
    let test = train.split_off(at);
    Ok((train, test))
}

pub fn filter_by_length(lists: PasswordLists, max_length: i64) -> Result<PasswordLists> {
    if max_length <= 0 {
        return Err(BenchError::config(format!("max_length must be positive, got {}", max_length)));
    }
    let max = max_length as usize;
    let keep = |p: &String| {
        let len = p.chars().count();
        len > 0 && len <= max
    };
    Ok(PasswordLists {
        train: lists.train.into_iter().filter(keep).collect(),
        test: lists.test.into_iter().filter(keep).collect(),
    })
}

pub fn filter_by_char_bag(lists: PasswordLists, bag: &str) -> PasswordLists {
    let allowed: HashSet<char> = bag.chars().collect();
    let keep = |p: &String| p.chars().all(|c| allowed.contains(&c));
    PasswordLists {
        train: lists.train.into_iter().filter(keep).collect(),
        test: lists.test.into_iter().filter(keep).collect(),
    }
}

pub fn standard_split(lists: PasswordLists, percentage: i64) -> Result<PasswordLists> {
    let explicit_test = lists.test;
    let (train, remainder) = percentage_split(lists.train, percentage)?;

    let test = if explicit_test.is_empty() {
        let seen: HashSet<&str> = train.iter().map(String::as_str).collect();
        remainder.into_iter().filter(|p| !seen.contains(p.as_str())).collect()
    } else {
        explicit_test
    };

    Ok(PasswordLists { train, test })
}

pub fn test_centric_split(lists: PasswordLists, percentage: i64, rng: &mut StdRng) -> Result<PasswordLists> {
    let explicit_test = lists.test;
    let mut shuffled = lists.train;
    shuffled.shuffle(rng);

    let (train, remainder) = percentage_split(shuffled, percentage)?;

    let in_test: HashSet<&str> = remainder.iter().map(String::as_str).collect();
    let mut train: Vec<String> = train.into_iter().filter(|p| !in_test.contains(p.as_str())).collect();
    train.shuffle(rng);

    let test = if explicit_test.is_empty() { remainder } else { explicit_test };
    Ok(PasswordLists { train, test })
}

pub fn filter_by_frequency(lists: PasswordLists, frequency: i64) -> Result<PasswordLists> {
    if !(-100..=100).contains(&frequency) {
        return Err(BenchError::config(format!(
            "test_frequency must be in [-100, 100], got {}",
            frequency
        )));
    }

    // (password, count) in first-appearance order
    let mut order: Vec<(String, usize)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for password in lists.test {
        match index.get(&password) {
            Some(&i) => order[i].1 += 1,
            None => {
                index.insert(password.clone(), order.len());
                order.push((password, 1));
            }
        }
    }

    // Stable sort keeps first appearance among equal counts
    order.sort_by(|a, b| b.1.cmp(&a.1));
    if frequency < 0 {
        order.reverse();
    }

    let unique = order.len();
    let n = ((unique as u128 * frequency.unsigned_abs() as u128 / 100) as usize).max(1);
    order.truncate(n);

    Ok(PasswordLists {
        train: lists.train,
        test: order.into_iter().map(|(p, _)| p).collect(),
    })
}

pub fn chunk_train_dataset(lists: PasswordLists, chunk: i64) -> Result<PasswordLists> {
    if chunk <= 0 {
        return Err(BenchError::config(format!(
            "train_chunk_percentage must be positive, got {}",
            chunk
        )));
    }

    let len = lists.train.len();
    let chunk = chunk as usize;
    let keep = if chunk > 100 && chunk < len {
        chunk
    } else if chunk < 100 {
        len * chunk / 100
    } else {
        len
    };

    let mut train = lists.train;
    train.truncate(keep);
    Ok(PasswordLists { train, test: lists.test })
}
