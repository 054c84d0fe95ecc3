//! Training algorithms
//!
//! This module implements the PPO training update.

pub mod ppo;

pub use ppo::{
    AdaptiveKlController, EpochScheduler, LossAssembler, LossInfo, Optimizer, PPOConfig, PpoAgent,
    TorchOptimizer, TrainStepOutput,
};
