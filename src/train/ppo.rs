//! Proximal Policy Optimization (PPO) algorithm
//!
//! This module implements the training-update core of a PPO agent.
//! PPO is a policy gradient method that uses a clipped surrogate objective
//! and a KL penalty to keep each update close to the data-collection policy.
//!
//! # Algorithm Overview
//!
//! ```text
//! For each training call:
//!   1. Slice the trajectory into transitions and mask invalid steps
//!   2. Compute returns and advantages (Monte Carlo or GAE)
//!   3. For num_epochs passes over the same batch:
//!      a. Re-evaluate the policy and value networks
//!      b. Compute the five loss terms
//!      c. Apply one optimizer step
//!   4. Update the adaptive KL coefficient from the final policy
//!   5. Update observation/reward normalizers
//! ```
//!
//! # References
//!
//! - [Proximal Policy Optimization Algorithms](https://arxiv.org/abs/1707.06347)
//! - [OpenAI Spinning Up: PPO](https://spinningup.openai.com/en/latest/algorithms/ppo.html)

pub mod agent;
pub mod config;
pub mod kl;
pub mod loss;
pub mod optimizer;
pub mod scheduler;
pub mod stats;

pub use agent::PpoAgent;
pub use config::PPOConfig;
pub use kl::{beta_update_factor, AdaptiveKlController, BETA_FLOOR};
pub use loss::{
    adaptive_kl_loss, entropy_regularization_loss, kl_cutoff_loss, l2_regularization_loss,
    masked_mean, policy_gradient_loss, value_estimation_loss, LossAssembler, LossInputs,
    LossTerms, PolicyGradientLoss,
};
pub use optimizer::{Optimizer, TorchOptimizer};
pub use scheduler::{EpochScheduler, EpochSummary};
pub use stats::{LossInfo, TrainStepOutput};
