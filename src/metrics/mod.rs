//! Metrics computed across completed runs.

pub mod crossrun;

pub use crossrun::{EvaluationSummary, Metric, MetricRow, Overlap, RunLabel, combinations, cross_run, evaluate, overlap};
