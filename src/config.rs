//! Configuration loading from passbench.toml and scenario files.
//!
//! ## General settings
//!
//! ```toml
//! [paths]
//! datasets = "datasets"
//! results = "results"
//!
//! [execution]
//! parallel_runs = 2
//! display_logs = false
//! scenarios = ["scenarios/standard.toml"]
//!
//! [general_params]
//! models = ["ngram"]
//! n_samples = [1000000, 10000000]
//!
//! [pre_split_params]
//! train_datasets = ["rockyou"]
//!
//! [models.ngram]
//! epochs = 10
//! order = 4
//! ```
//!
//! ## Scenario files
//!
//! Each top-level table is a scenario; its `steps` array lists the
//! preprocessing steps in the order they run, each declaring the parameter
//! values it consumes:
//!
//! ```toml
//! [[standard.steps]]
//! step = "filter_by_length"
//! group = "pre_split_params"
//! params = { max_length = [12, 16] }
//! ```
//!
//! A parameter takes its values from the first source that declares it:
//! command-line overrides, then the scenario, then the general settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::{Pipeline, PreprocessStep};
use crate::error::{BenchError, Result};
use crate::matrix::ParameterMatrix;
use crate::model::ModelSettings;
use crate::types::{ParamGroup, ParamValue, RunSpec};

/// Default name of the general settings file.
pub const SETTINGS_FILE: &str = "passbench.toml";

/// Groups of the parameters every installation knows about. Anything else
/// must be declared in a group table or carry an explicit group.
const KNOWN_PARAMS: &[(&str, ParamGroup)] = &[
    ("models", ParamGroup::General),
    ("n_samples", ParamGroup::General),
    ("autoload", ParamGroup::General),
    ("path_to_checkpoint", ParamGroup::General),
    ("test_reference", ParamGroup::General),
    ("use_existing_samples", ParamGroup::General),
    ("train_datasets", ParamGroup::PreSplit),
    ("max_length", ParamGroup::PreSplit),
    ("char_bag", ParamGroup::PreSplit),
    ("train_split_percentage", ParamGroup::Split),
    ("train_chunk_percentage", ParamGroup::PostSplit),
    ("test_frequency", ParamGroup::Test),
    ("test_datasets", ParamGroup::Test),
];

pub fn known_group(name: &str) -> Option<ParamGroup> {
    KNOWN_PARAMS.iter().find(|(n, _)| *n == name).map(|(_, g)| *g)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub datasets: PathBuf,
    pub cache: PathBuf,
    pub checkpoints: PathBuf,
    pub results: PathBuf,
    pub logs: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            datasets: PathBuf::from("datasets"),
            cache: PathBuf::from("cache"),
            checkpoints: PathBuf::from("checkpoints"),
            results: PathBuf::from("results"),
            logs: PathBuf::from("logs"),
        }
    }
}

impl PathsConfig {
    /// Resolve relative paths against `base`.
    pub fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.datasets,
            &mut self.cache,
            &mut self.checkpoints,
            &mut self.results,
            &mut self.logs,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Runs evaluated concurrently
    pub parallel_runs: usize,
    /// Log to the terminal instead of `<logs>/passbench.log`
    pub display_logs: bool,
    /// Device label handed to models
    pub device: String,
    /// Scenario files used when none are given on the command line
    pub scenarios: Vec<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallel_runs: 1,
            display_logs: true,
            device: "cpu".to_string(),
            scenarios: Vec::new(),
        }
    }
}

/// Raw general settings as deserialized from TOML.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    paths: PathsConfig,
    execution: ExecutionConfig,
    general_params: toml::Table,
    pre_split_params: toml::Table,
    split_params: toml::Table,
    post_split_params: toml::Table,
    test_params: toml::Table,
    models: BTreeMap<String, ModelSettings>,
}

/// Parameter values of one source, grouped.
pub type ParamTable = BTreeMap<ParamGroup, BTreeMap<String, Vec<ParamValue>>>;

/// General settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// File this configuration was read from, for display
    pub source: Option<PathBuf>,
    pub paths: PathsConfig,
    pub execution: ExecutionConfig,
    pub params: ParamTable,
    pub models: BTreeMap<String, ModelSettings>,
}

impl Settings {
    /// Load `passbench.toml` from `path`. Relative paths inside it resolve
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BenchError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut settings = Self::parse(&content)
            .map_err(|e| BenchError::config(format!("{}: {}", path.display(), e)))?;
        if let Some(base) = path.parent() {
            settings.paths.rebase(base);
            settings.execution.scenarios = settings
                .execution
                .scenarios
                .into_iter()
                .map(|p| if p.is_relative() { base.join(p) } else { p })
                .collect();
        }
        settings.source = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Load from a directory if it holds a settings file, defaults otherwise.
    pub fn discover(directory: &Path) -> Result<Self> {
        let candidate = directory.join(SETTINGS_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            tracing::debug!(dir = %directory.display(), "no settings file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawSettings = toml::from_str(content).map_err(|e| BenchError::config(e.to_string()))?;

        let mut params = ParamTable::new();
        for (group, table) in [
            (ParamGroup::General, &raw.general_params),
            (ParamGroup::PreSplit, &raw.pre_split_params),
            (ParamGroup::Split, &raw.split_params),
            (ParamGroup::PostSplit, &raw.post_split_params),
            (ParamGroup::Test, &raw.test_params),
        ] {
            for (name, value) in table {
                params
                    .entry(group)
                    .or_default()
                    .insert(name.clone(), value_list(name, value)?);
            }
        }

        Ok(Self {
            source: None,
            paths: raw.paths,
            execution: raw.execution,
            params,
            models: raw.models,
        })
    }

    pub fn model_settings(&self, model: &str) -> ModelSettings {
        self.models.get(model).cloned().unwrap_or_default()
    }

    fn group_of(&self, name: &str) -> Option<ParamGroup> {
        self.params
            .iter()
            .find(|(_, params)| params.contains_key(name))
            .map(|(group, _)| *group)
    }
}

/// A scalar or an array of scalars, as a value list.
fn value_list(name: &str, value: &toml::Value) -> Result<Vec<ParamValue>> {
    let invalid = || BenchError::config(format!("parameter '{}' must be a scalar or an array of scalars", name));
    match value {
        toml::Value::Array(items) => items
            .iter()
            .map(|item| ParamValue::from_toml(item).ok_or_else(invalid))
            .collect(),
        scalar => Ok(vec![ParamValue::from_toml(scalar).ok_or_else(invalid)?]),
    }
}

#[derive(Debug, Deserialize)]
struct RawStep {
    step: String,
    group: String,
    #[serde(default)]
    params: toml::Table,
}

#[derive(Debug, Deserialize)]
struct RawScenario {
    #[serde(default)]
    steps: Vec<RawStep>,
}

/// One declared preprocessing step.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioStep {
    pub step: PreprocessStep,
    pub group: ParamGroup,
    pub params: BTreeMap<String, Vec<ParamValue>>,
}

/// A named scenario: ordered preprocessing steps and their parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    /// Every scenario of a file, sorted by name.
    pub fn load_file(path: &Path) -> Result<Vec<Self>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BenchError::config(format!("cannot read scenario {}: {}", path.display(), e)))?;
        Self::parse_all(&content).map_err(|e| BenchError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse_all(content: &str) -> Result<Vec<Self>> {
        let raw: BTreeMap<String, RawScenario> =
            toml::from_str(content).map_err(|e| BenchError::config(e.to_string()))?;

        raw.into_iter()
            .map(|(name, scenario)| {
                let steps = scenario
                    .steps
                    .into_iter()
                    .map(|raw| parse_step(&name, raw))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Scenario { name, steps })
            })
            .collect()
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.steps.iter().map(|s| s.step).collect())
    }

    /// Group of a parameter declared by one of the steps.
    pub fn group_of(&self, name: &str) -> Option<ParamGroup> {
        self.steps
            .iter()
            .find(|s| s.params.contains_key(name))
            .map(|s| s.group)
    }

    /// The single configuration this scenario describes when used as a
    /// reference: the first value of every declared parameter.
    pub fn reference_spec(&self) -> RunSpec {
        let mut spec = RunSpec::new(self.name.clone());
        for step in &self.steps {
            for (name, values) in &step.params {
                if let Some(first) = values.first() {
                    spec.insert(name.clone(), step.group, first.clone());
                }
            }
        }
        spec
    }
}

fn parse_step(scenario: &str, raw: RawStep) -> Result<ScenarioStep> {
    let step = PreprocessStep::from_name(&raw.step).ok_or_else(|| {
        BenchError::config(format!("scenario '{}': unknown preprocessing step '{}'", scenario, raw.step))
    })?;
    let group = ParamGroup::from_table_name(&raw.group).ok_or_else(|| {
        BenchError::config(format!("scenario '{}': unknown parameter group '{}'", scenario, raw.group))
    })?;
    let params = raw
        .params
        .iter()
        .map(|(name, value)| Ok((name.clone(), value_list(name, value)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(ScenarioStep { step, group, params })
}

/// A command-line parameter override: `[group:]name=v1,v2`.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub group: Option<ParamGroup>,
    pub name: String,
    pub values: Vec<ParamValue>,
}

impl Override {
    pub fn parse(arg: &str) -> Result<Self> {
        let (key, values) = arg
            .split_once('=')
            .ok_or_else(|| BenchError::config(format!("override '{}' is not of the form name=value", arg)))?;
        let (group, name) = match key.split_once(':') {
            Some((group, name)) => {
                let group = ParamGroup::from_table_name(group)
                    .ok_or_else(|| BenchError::config(format!("unknown parameter group '{}'", group)))?;
                (Some(group), name)
            }
            None => (None, key),
        };
        let values = values.split(',').map(parse_cli_value).collect();
        Ok(Self {
            group,
            name: name.trim().to_string(),
            values,
        })
    }
}

/// Typed value from a command-line string.
pub fn parse_cli_value(raw: &str) -> ParamValue {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        ParamValue::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        ParamValue::Float(f)
    } else if let Ok(b) = raw.parse::<bool>() {
        ParamValue::Bool(b)
    } else {
        ParamValue::Text(raw.to_string())
    }
}

/// Merge overrides, one scenario and the general settings into a matrix.
pub fn build_matrix(settings: &Settings, scenario: &Scenario, overrides: &[Override]) -> Result<ParameterMatrix> {
    let mut matrix = ParameterMatrix::new(scenario.name.clone());

    for o in overrides {
        let group = o
            .group
            .or_else(|| scenario.group_of(&o.name))
            .or_else(|| settings.group_of(&o.name))
            .or_else(|| known_group(&o.name))
            .ok_or_else(|| {
                BenchError::config(format!(
                    "cannot tell the group of parameter '{}', write it as <group>:{}=...",
                    o.name, o.name
                ))
            })?;
        matrix.declare(group, &o.name, o.values.clone())?;
    }

    for step in &scenario.steps {
        for (name, values) in &step.params {
            matrix.declare(step.group, name, values.clone())?;
        }
    }

    for (group, params) in &settings.params {
        for (name, values) in params {
            matrix.declare(*group, name, values.clone())?;
        }
    }

    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
        [paths]
        results = "out"

        [execution]
        parallel_runs = 4

        [general_params]
        models = "ngram"
        n_samples = [100, 1000]

        [pre_split_params]
        train_datasets = ["rockyou"]
        max_length = 16

        [models.ngram]
        epochs = 3
        order = 3
    "#;

    const SCENARIO: &str = r#"
        [[standard.steps]]
        step = "standard_preprocessing.filter_by_length"
        group = "pre_split_params"
        params = { max_length = [10, 12] }

        [[standard.steps]]
        step = "standard_split"
        group = "split_params"
        params = { train_split_percentage = 80 }
    "#;

    #[test]
    fn test_settings_parse() {
        let settings = Settings::parse(SETTINGS).unwrap();
        assert_eq!(settings.paths.results, PathBuf::from("out"));
        assert_eq!(settings.paths.datasets, PathBuf::from("datasets"));
        assert_eq!(settings.execution.parallel_runs, 4);
        assert!(settings.execution.display_logs);
        assert_eq!(
            settings.params[&ParamGroup::General]["n_samples"],
            vec![ParamValue::Int(100), ParamValue::Int(1000)]
        );
        assert_eq!(settings.model_settings("ngram").epochs, 3);
        assert_eq!(settings.model_settings("other").epochs, ModelSettings::default().epochs);
    }

    #[test]
    fn test_scenario_steps_keep_declared_order() {
        let scenarios = Scenario::parse_all(SCENARIO).unwrap();
        assert_eq!(scenarios.len(), 1);
        let steps: Vec<PreprocessStep> = scenarios[0].pipeline().steps().to_vec();
        assert_eq!(steps, vec![PreprocessStep::FilterByLength, PreprocessStep::StandardSplit]);
        assert_eq!(scenarios[0].group_of("train_split_percentage"), Some(ParamGroup::Split));
    }

    #[test]
    fn test_unknown_step_rejected() {
        let err = Scenario::parse_all(
            r#"
            [[x.steps]]
            step = "shuffle_everything"
            group = "split_params"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
    }

    #[test]
    fn test_precedence_cli_then_scenario_then_settings() {
        let settings = Settings::parse(SETTINGS).unwrap();
        let scenario = &Scenario::parse_all(SCENARIO).unwrap()[0];
        let overrides = vec![Override::parse("n_samples=5").unwrap()];

        let matrix = build_matrix(&settings, scenario, &overrides).unwrap();
        assert_eq!(matrix.values("n_samples").unwrap(), &[ParamValue::Int(5)]);
        assert_eq!(matrix.values("max_length").unwrap(), &[ParamValue::Int(10), ParamValue::Int(12)]);
        assert_eq!(matrix.values("train_datasets").unwrap(), &[ParamValue::Text("rockyou".into())]);
        assert_eq!(matrix.combinations().unwrap(), 2);
    }

    #[test]
    fn test_override_parsing() {
        let o = Override::parse("test_params:test_frequency=-10,10").unwrap();
        assert_eq!(o.group, Some(ParamGroup::Test));
        assert_eq!(o.values, vec![ParamValue::Int(-10), ParamValue::Int(10)]);

        assert_eq!(parse_cli_value("0.5"), ParamValue::Float(0.5));
        assert_eq!(parse_cli_value("true"), ParamValue::Bool(true));
        assert_eq!(parse_cli_value("rockyou"), ParamValue::Text("rockyou".into()));
        assert!(Override::parse("no_equals").is_err());
    }

    #[test]
    fn test_unknown_override_group_is_error() {
        let settings = Settings::default();
        let scenario = Scenario {
            name: "s".into(),
            steps: Vec::new(),
        };
        let overrides = vec![Override::parse("mystery=1").unwrap()];
        assert!(build_matrix(&settings, &scenario, &overrides).is_err());
    }

    #[test]
    fn test_reference_spec_takes_first_values() {
        let scenario = &Scenario::parse_all(SCENARIO).unwrap()[0];
        let spec = scenario.reference_spec();
        assert_eq!(spec.scenario, "standard");
        assert_eq!(spec.get("max_length"), Some(&ParamValue::Int(10)));
        assert_eq!(spec.group_of("train_split_percentage"), Some(ParamGroup::Split));
    }
}
