//! Error types for passbench.
//!
//! The taxonomy follows the blast radius of each failure:
//!
//! | Variant            | Scope                                      |
//! |--------------------|--------------------------------------------|
//! | `Configuration`    | whole invocation, raised before any run    |
//! | `CheckpointLoad`   | recoverable, lifecycle falls back to train |
//! | `CheckpointSave`   | fatal for the run                          |
//! | `StreamFormat`     | fatal for the file being read              |
//! | `Cache`            | whole invocation (shared infrastructure)   |
//! | `ResultsTable`     | whole invocation (shared infrastructure)   |
//! | `Model`, `Io`      | fatal for the run                          |
//!
//! A split cache miss is not an error: lookups return `Option`.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias for passbench operations.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors that can occur while expanding, running or measuring experiments.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Invalid or contradictory configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A checkpoint could not be restored.
    #[error("failed to load checkpoint {path}: {source}")]
    CheckpointLoad {
        path: PathBuf,
        #[source]
        source: LoadError,
    },

    /// A checkpoint could not be persisted.
    #[error("failed to save checkpoint {path}: {reason}")]
    CheckpointSave { path: PathBuf, reason: String },

    /// Malformed compressed or line-oriented input.
    #[error("malformed stream {path}: {reason}")]
    StreamFormat { path: PathBuf, reason: String },

    /// Split cache read/write failure.
    #[error("split cache failure for {identity}: {reason}")]
    Cache { identity: String, reason: String },

    /// Results table append failure.
    #[error("results table {path}: {reason}")]
    ResultsTable { path: PathBuf, reason: String },

    /// Failure inside a model implementation.
    #[error("model {model}: {reason}")]
    Model { model: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BenchError {
    pub fn config(msg: impl Into<String>) -> Self {
        BenchError::Configuration(msg.into())
    }

    pub fn stream(path: &Path, reason: impl ToString) -> Self {
        BenchError::StreamFormat {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn checkpoint_save(path: &Path, reason: impl ToString) -> Self {
        BenchError::CheckpointSave {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn model(model: &str, reason: impl ToString) -> Self {
        BenchError::Model {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Failures in shared infrastructure invalidate every downstream metric,
    /// so they end the whole invocation rather than a single run.
    pub fn is_fatal_for_invocation(&self) -> bool {
        matches!(
            self,
            BenchError::Configuration(_) | BenchError::Cache { .. } | BenchError::ResultsTable { .. }
        )
    }
}

/// Why a checkpoint could not be restored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("checkpoint file does not exist")]
    Missing,

    #[error("checkpoint is corrupt: {0}")]
    Corrupt(String),

    #[error("checkpoint belongs to model '{found}', expected '{expected}'")]
    WrongModel { expected: String, found: String },

    #[error("model rejected checkpoint state: {0}")]
    Rejected(String),
}
