//! passbench - evaluation harness for password-guessing models
//!
//! Expands scenario configurations into concrete runs, derives and caches
//! train/test splits, trains models with proxy-driven checkpointing and
//! streams their guesses against the test set.
//!
//! # Architecture
//!
//! ```text
//! Settings + Scenarios → ParameterMatrix → RunSpecs → SplitCache → CheckpointLifecycle → Evaluation
//!         ↓                     ↓               ↓            ↓               ↓                  ↓
//!     toml/serde           mixed radix      sha2 ids      redb +        mid/final ckpt     thresholds,
//!                                                        bincode      + early stopping    top-K, gzip
//! ```
//!
//! Completed runs append to per-scenario CSV tables; cross-run metrics
//! (Jaccard, mergeability) read the persisted guess files.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod eval;
pub mod matrix;
pub mod metrics;
pub mod model;
pub mod runner;
pub mod sampling;
pub mod types;

pub use error::{BenchError, LoadError, Result};
pub use types::{ParamGroup, ParamValue, RunSpec};

pub use config::{Override, Scenario, Settings};
pub use eval::{EvalMode, EvalPlan, EvalReport};
pub use matrix::{HashedIdentity, IdentityScope, ParameterMatrix};
pub use model::{ModelRegistry, ModelSettings, PasswordModel};
pub use runner::{ExecutionContext, RunContext, RunRecord, RunStatus, Runner};
