//! Guided sampling: steer generation towards regions that already produced
//! matches.

pub mod controller;

pub use controller::{AdaptiveSamplingController, GuidedSamplingParams, RunningMean, SteeringRequest};
