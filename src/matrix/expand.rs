//! Cartesian expansion of a configuration matrix into concrete runs.
//!
//! Parameters are enumerated group by group in [`ParamGroup::ORDER`], keys
//! sorted within a group, with the last parameter varying fastest (the same
//! order as a nested loop over the declaration). Single-element lists simply
//! contribute a constant.

use std::collections::BTreeMap;

use crate::error::{BenchError, Result};
use crate::types::{ParamGroup, ParamValue, RunSpec};

/// Multi-valued parameters of one scenario, grouped.
#[derive(Debug, Clone, Default)]
pub struct ParameterMatrix {
    pub scenario: String,
    groups: BTreeMap<ParamGroup, BTreeMap<String, Vec<ParamValue>>>,
}

impl ParameterMatrix {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            groups: BTreeMap::new(),
        }
    }

    /// Declare a parameter unless it is already declared in the same group.
    ///
    /// Sources are merged highest precedence first, so the first writer wins.
    /// Returns whether the values were taken.
    pub fn declare(&mut self, group: ParamGroup, name: &str, values: Vec<ParamValue>) -> Result<bool> {
        if values.is_empty() {
            return Err(BenchError::config(format!(
                "scenario '{}': parameter '{}' has no values",
                self.scenario, name
            )));
        }

        if let Some(other) = self.group_of(name) {
            if other != group {
                return Err(BenchError::config(format!(
                    "scenario '{}': parameter '{}' declared in both {} and {}",
                    self.scenario,
                    name,
                    other.table_name(),
                    group.table_name()
                )));
            }
            return Ok(false);
        }

        self.groups
            .entry(group)
            .or_default()
            .insert(name.to_string(), values);
        Ok(true)
    }

    pub fn group_of(&self, name: &str) -> Option<ParamGroup> {
        self.groups
            .iter()
            .find(|(_, params)| params.contains_key(name))
            .map(|(group, _)| *group)
    }

    pub fn values(&self, name: &str) -> Option<&[ParamValue]> {
        self.groups
            .values()
            .find_map(|params| params.get(name))
            .map(Vec::as_slice)
    }

    /// Remove a parameter from the matrix, returning its values.
    pub fn take(&mut self, name: &str) -> Option<Vec<ParamValue>> {
        self.groups.values_mut().find_map(|params| params.remove(name))
    }

    /// Flattened dimensions in expansion order.
    fn dimensions(&self) -> Vec<(&str, ParamGroup, &[ParamValue])> {
        ParamGroup::ORDER
            .iter()
            .filter_map(|g| self.groups.get(g).map(|params| (*g, params)))
            .flat_map(|(g, params)| {
                params
                    .iter()
                    .map(move |(name, values)| (name.as_str(), g, values.as_slice()))
            })
            .collect()
    }

    /// Number of runs the matrix expands to.
    pub fn combinations(&self) -> Result<usize> {
        self.dimensions().iter().try_fold(1usize, |acc, (name, _, values)| {
            acc.checked_mul(values.len()).ok_or_else(|| {
                BenchError::config(format!(
                    "scenario '{}': expansion overflows at parameter '{}'",
                    self.scenario, name
                ))
            })
        })
    }
}

/// Expand the matrix into its full Cartesian product and validate every run.
pub fn expand(matrix: &ParameterMatrix) -> Result<Vec<RunSpec>> {
    let dims = matrix.dimensions();
    let total = matrix.combinations()?;

    let mut specs = Vec::with_capacity(total);
    for idx in 0..total {
        // Mixed-radix decomposition, last dimension fastest
        let mut spec = RunSpec::new(matrix.scenario.clone());
        let mut remaining = idx;
        for (name, group, values) in dims.iter().rev() {
            let choice = remaining % values.len();
            remaining /= values.len();
            spec.insert(*name, *group, values[choice].clone());
        }
        validate(&spec)?;
        specs.push(spec);
    }

    Ok(specs)
}

/// Reject contradictory parameter combinations.
pub fn validate(spec: &RunSpec) -> Result<()> {
    if spec.contains("test_datasets") && !spec.contains("train_datasets") {
        return Err(BenchError::config(format!(
            "scenario '{}': test_datasets requires train_datasets",
            spec.scenario
        )));
    }

    if spec.is_set("autoload") && spec.contains("path_to_checkpoint") {
        return Err(BenchError::config(format!(
            "scenario '{}': autoload and path_to_checkpoint are mutually exclusive",
            spec.scenario
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vals(items: &[i64]) -> Vec<ParamValue> {
        items.iter().map(|v| ParamValue::Int(*v)).collect()
    }

    fn sample_matrix() -> ParameterMatrix {
        let mut m = ParameterMatrix::new("standard");
        m.declare(ParamGroup::General, "models", vec!["ngram".into(), "other".into()])
            .unwrap();
        m.declare(ParamGroup::PreSplit, "train_datasets", vec!["rockyou".into()])
            .unwrap();
        m.declare(ParamGroup::PreSplit, "max_length", vals(&[8, 10, 12]))
            .unwrap();
        m.declare(ParamGroup::Split, "train_split_percentage", vals(&[80]))
            .unwrap();
        m
    }

    #[test]
    fn test_expansion_size_and_uniqueness() {
        let specs = expand(&sample_matrix()).unwrap();
        assert_eq!(specs.len(), 6);

        for (i, a) in specs.iter().enumerate() {
            for b in &specs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_expansion_order_last_dimension_fastest() {
        let specs = expand(&sample_matrix()).unwrap();
        let lengths: Vec<_> = specs
            .iter()
            .map(|s| s.get("max_length").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(lengths, vec![8, 10, 12, 8, 10, 12]);
        assert_eq!(specs[0].text("models").unwrap(), "ngram");
        assert_eq!(specs[3].text("models").unwrap(), "other");
    }

    #[test]
    fn test_single_values_collapse_and_keep_type() {
        let specs = expand(&sample_matrix()).unwrap();
        for spec in &specs {
            assert_eq!(spec.get("train_split_percentage"), Some(&ParamValue::Int(80)));
            assert_eq!(spec.group_of("train_split_percentage"), Some(ParamGroup::Split));
        }
    }

    #[test]
    fn test_first_declaration_wins() {
        let mut m = ParameterMatrix::new("s");
        assert!(m.declare(ParamGroup::General, "n_samples", vals(&[10])).unwrap());
        assert!(!m.declare(ParamGroup::General, "n_samples", vals(&[20])).unwrap());
        assert_eq!(m.values("n_samples").unwrap(), &vals(&[10])[..]);
    }

    #[test]
    fn test_conflicting_groups_rejected() {
        let mut m = ParameterMatrix::new("s");
        m.declare(ParamGroup::PreSplit, "max_length", vals(&[10])).unwrap();
        let err = m.declare(ParamGroup::Test, "max_length", vals(&[10])).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
    }

    #[test]
    fn test_empty_values_rejected() {
        let mut m = ParameterMatrix::new("s");
        assert!(m.declare(ParamGroup::General, "models", vec![]).is_err());
    }

    #[test]
    fn test_test_datasets_requires_train_datasets() {
        let mut m = ParameterMatrix::new("cross");
        m.declare(ParamGroup::Test, "test_datasets", vec!["linkedin".into()])
            .unwrap();
        let err = expand(&m).unwrap_err();
        assert!(err.to_string().contains("test_datasets requires train_datasets"));
    }

    #[test]
    fn test_autoload_and_explicit_checkpoint_conflict() {
        let mut m = sample_matrix();
        m.declare(ParamGroup::General, "autoload", vals(&[1])).unwrap();
        m.declare(ParamGroup::General, "path_to_checkpoint", vec!["/tmp/c.ckpt".into()])
            .unwrap();
        assert!(matches!(expand(&m), Err(BenchError::Configuration(_))));

        // autoload = 0 does not conflict
        let mut m = sample_matrix();
        m.declare(ParamGroup::General, "autoload", vals(&[0])).unwrap();
        m.declare(ParamGroup::General, "path_to_checkpoint", vec!["/tmp/c.ckpt".into()])
            .unwrap();
        assert!(expand(&m).is_ok());
    }

    #[test]
    fn test_reference_combines_with_existing_samples() {
        let mut m = sample_matrix();
        m.declare(ParamGroup::General, "test_reference", vec!["/tmp/reference".into()])
            .unwrap();
        m.declare(ParamGroup::General, "use_existing_samples", vals(&[1000]))
            .unwrap();
        let specs = expand(&m).unwrap();
        assert_eq!(specs.len(), 6);
        assert!(specs.iter().all(|s| s.contains("test_reference") && s.contains("use_existing_samples")));
    }

    #[test]
    fn test_empty_matrix_expands_to_single_run() {
        let specs = expand(&ParameterMatrix::new("empty")).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].iter().count(), 0);
    }
}
