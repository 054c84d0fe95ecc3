//! # ppo-learner
//!
//! Training-update core of a Proximal Policy Optimization agent in Rust,
//! built on PyTorch tensors and autograd (via tch-rs).
//!
//! Given a batch of collected trajectories, the crate computes returns and
//! advantages, assembles the PPO loss, drives the optimizer through a fixed
//! number of epochs and maintains the state that carries across training
//! calls: streaming observation/reward normalizers and the adaptive KL
//! coefficient.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ppo_learner::prelude::*;
//!
//! fn train_once<A: ActorNetwork, V: ValueNetwork, O: Optimizer>(
//!     agent: &mut PpoAgent<A, V, O>,
//!     trajectory: &Trajectory,
//! ) -> Result<()> {
//!     let output = agent.train(trajectory)?;
//!     println!("total loss {:.4}, beta {:?}", output.loss.total_loss, output.adaptive_kl_beta);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types shared by every module
pub mod error;

/// Action distributions and network collaborator traits
pub mod policy;

/// Trajectory preprocessing, masks and return/advantage estimation
pub mod buffer;

/// Training algorithms (PPO)
pub mod train;

/// Utility functions and helpers
pub mod utils;

/// Prelude module for convenient imports
///
/// This module re-exports commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::{
        buffer::{PolicyStep, StepType, TimeStep, Trajectory},
        error::{PpoError, Result},
        policy::{ActionSpec, ActorNetwork, DistributionKind, DistributionParams, ValueNetwork},
        train::{LossInfo, Optimizer, PPOConfig, PpoAgent, TorchOptimizer, TrainStepOutput},
        utils::{NormalizerStats, StreamingNormalizer},
    };
}

/// Current version of ppo-learner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
