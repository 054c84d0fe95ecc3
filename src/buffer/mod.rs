//! Trajectory preprocessing and return/advantage estimation
//!
//! This module turns collected trajectories into training inputs:
//! - Slicing trajectories into `(t, t + 1)` transitions
//! - Validity and episode masks
//! - Monte Carlo returns, GAE advantages and TD(λ) targets
//!
//! # Layout
//!
//! All tensors use a `[batch, time, ...]` layout. A trajectory of `L + 1`
//! steps yields `L` transitions per row.

pub mod gae;
pub mod mask;
pub mod trajectory;

pub use gae::{
    compute_advantages, compute_returns, normalize_advantages, ReturnEstimator,
    ReturnsAndAdvantages, ADVANTAGE_EPSILON,
};
pub use mask::{episode_mask, make_timestep_mask};
pub use trajectory::{PolicyStep, StepType, TimeStep, Trajectory, Transition};
