//! Resumable training: checkpoint files, proxy-driven early stopping and
//! the per-run lifecycle tying them together.

pub mod early_stop;
pub mod lifecycle;
pub mod store;

pub use early_stop::{EarlyStoppingConfig, ProxyDecision, ProxyTracker};
pub use lifecycle::{CheckpointLifecycle, LifecycleState, StartupRequest, TrainingOutcome};
pub use store::{Checkpoint, CheckpointKind, CheckpointStore};
