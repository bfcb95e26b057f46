//! Core types shared by every stage of an experiment.
//!
//! A configuration matrix is a set of named parameters, each holding a list of
//! candidate values and belonging to one of five ordered groups. Expansion
//! turns the matrix into concrete [`RunSpec`]s, one per Cartesian tuple.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// A single configured value.
///
/// The variant is preserved from the configuration file through expansion and
/// identity hashing, so `10` and `"10"` are different values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            ParamValue::Text(s) => s.trim().parse().ok(),
            ParamValue::Bool(_) => None,
            ParamValue::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Text(s) => s.trim().parse().ok(),
            ParamValue::Bool(_) => None,
        }
    }

    /// Truthiness as the settings files use it: `true`, non-zero numbers and
    /// the strings "1"/"true"/"yes".
    pub fn is_truthy(&self) -> bool {
        match self {
            ParamValue::Bool(b) => *b,
            ParamValue::Int(v) => *v != 0,
            ParamValue::Float(v) => *v != 0.0,
            ParamValue::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        }
    }

    /// Convert a TOML value. Arrays and tables are not scalar parameters.
    pub fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::String(s) => Some(ParamValue::Text(s.clone())),
            toml::Value::Integer(i) => Some(ParamValue::Int(*i)),
            toml::Value::Float(f) => Some(ParamValue::Float(*f)),
            toml::Value::Boolean(b) => Some(ParamValue::Bool(*b)),
            toml::Value::Datetime(d) => Some(ParamValue::Text(d.to_string())),
            toml::Value::Array(_) | toml::Value::Table(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

/// Parameter group. The order of the variants is the expansion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    /// Does not affect the derived dataset (model name, sample count, ...)
    General,
    /// Applied to the raw data before splitting
    PreSplit,
    /// Controls the train/test split
    Split,
    /// Applied to the training data after the split
    PostSplit,
    /// Applied to the test data only
    Test,
}

impl ParamGroup {
    pub const ORDER: [ParamGroup; 5] = [
        ParamGroup::General,
        ParamGroup::PreSplit,
        ParamGroup::Split,
        ParamGroup::PostSplit,
        ParamGroup::Test,
    ];

    /// Table name used in settings files.
    pub fn table_name(self) -> &'static str {
        match self {
            ParamGroup::General => "general_params",
            ParamGroup::PreSplit => "pre_split_params",
            ParamGroup::Split => "split_params",
            ParamGroup::PostSplit => "post_split_params",
            ParamGroup::Test => "test_params",
        }
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|g| g.table_name() == name)
    }
}

/// One concrete experiment: a single value for every configured parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Scenario (test configuration) this spec was expanded from
    pub scenario: String,
    values: BTreeMap<String, ParamValue>,
    groups: BTreeMap<String, ParamGroup>,
}

impl RunSpec {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            values: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, group: ParamGroup, value: ParamValue) {
        let name = name.into();
        self.groups.insert(name.clone(), group);
        self.values.insert(name, value);
    }

    /// Builder-style insert, handy in tests.
    pub fn with(mut self, name: &str, group: ParamGroup, value: impl Into<ParamValue>) -> Self {
        self.insert(name, group, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn group_of(&self, name: &str) -> Option<ParamGroup> {
        self.groups.get(name).copied()
    }

    /// All (name, group, value) triples in sorted name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamGroup, &ParamValue)> {
        self.values
            .iter()
            .map(|(k, v)| (k.as_str(), self.groups[k.as_str()], v))
    }

    /// Values restricted to the given groups, sorted by name.
    pub fn scoped(&self, groups: &[ParamGroup]) -> BTreeMap<&str, &ParamValue> {
        self.iter()
            .filter(|(_, g, _)| groups.contains(g))
            .map(|(k, _, v)| (k, v))
            .collect()
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.to_string())
    }

    pub fn require(&self, name: &str) -> Result<&ParamValue> {
        self.get(name)
            .ok_or_else(|| BenchError::config(format!("missing required parameter '{}'", name)))
    }

    pub fn require_i64(&self, name: &str) -> Result<i64> {
        let value = self.require(name)?;
        value
            .as_i64()
            .ok_or_else(|| BenchError::config(format!("parameter '{}' must be an integer, got '{}'", name, value)))
    }

    pub fn require_text(&self, name: &str) -> Result<String> {
        self.require(name).map(|v| v.to_string())
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| v.is_truthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_value_conversions() {
        assert_eq!(ParamValue::Text("12".into()).as_i64(), Some(12));
        assert_eq!(ParamValue::Float(3.0).as_i64(), Some(3));
        assert_eq!(ParamValue::Float(3.5).as_i64(), None);
        assert_eq!(ParamValue::Bool(true).as_i64(), None);
        assert!(ParamValue::Text("yes".into()).is_truthy());
        assert!(!ParamValue::Int(0).is_truthy());
    }

    #[test]
    fn test_untagged_deserialization_keeps_type() {
        let values: Vec<ParamValue> = serde_json::from_str(r#"[10, "10", 1.5, true]"#).unwrap();
        assert_eq!(
            values,
            vec![
                ParamValue::Int(10),
                ParamValue::Text("10".into()),
                ParamValue::Float(1.5),
                ParamValue::Bool(true)
            ]
        );
    }

    #[test]
    fn test_group_table_names_roundtrip() {
        for group in ParamGroup::ORDER {
            assert_eq!(ParamGroup::from_table_name(group.table_name()), Some(group));
        }
        assert_eq!(ParamGroup::from_table_name("paths"), None);
    }

    #[test]
    fn test_scoped_view() {
        let spec = RunSpec::new("standard")
            .with("models", ParamGroup::General, "ngram")
            .with("max_length", ParamGroup::PreSplit, 10)
            .with("test_frequency", ParamGroup::Test, 5);

        let scoped = spec.scoped(&[ParamGroup::PreSplit]);
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped["max_length"], &ParamValue::Int(10));
        assert_eq!(spec.require_i64("test_frequency").unwrap(), 5);
        assert!(spec.require("train_datasets").is_err());
    }
}
