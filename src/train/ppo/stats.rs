//! Training statistics for PPO
//!
//! This module defines the scalar loss report of an epoch and the
//! output of a whole training call.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use super::loss::LossTerms;
use crate::error::Result;

/// Scalar losses and diagnostics of one or more epochs
///
/// Adding two reports sums every field, so a report aggregated over a
/// training call holds per-epoch sums.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossInfo {
    /// Total loss (plain sum of the five terms)
    pub total_loss: f64,

    /// Clipped-surrogate policy loss
    pub policy_gradient_loss: f64,

    /// Value estimation loss
    pub value_estimation_loss: f64,

    /// L2 regularization loss
    pub l2_regularization_loss: f64,

    /// Entropy regularization loss
    pub entropy_regularization_loss: f64,

    /// KL penalty loss (cutoff plus adaptive term)
    pub kl_penalty_loss: f64,

    /// Fraction of clipped importance ratios
    pub clip_fraction: f64,

    /// Mean importance ratio
    pub importance_ratio_mean: f64,

    /// Mean policy entropy
    pub entropy: f64,

    /// Mean KL divergence from the collection policy
    pub kl_divergence: f64,

    /// Number of epochs folded into this report
    pub num_epochs: usize,
}

impl LossInfo {
    /// Create zero-initialized statistics
    pub fn zeros() -> Self {
        Self::default()
    }

    /// Extract scalars from one epoch's loss tensors
    pub fn from_terms(terms: &LossTerms) -> Result<Self> {
        Ok(Self {
            total_loss: f64::try_from(&terms.total_loss)?,
            policy_gradient_loss: f64::try_from(&terms.policy_gradient_loss)?,
            value_estimation_loss: f64::try_from(&terms.value_estimation_loss)?,
            l2_regularization_loss: f64::try_from(&terms.l2_regularization_loss)?,
            entropy_regularization_loss: f64::try_from(&terms.entropy_regularization_loss)?,
            kl_penalty_loss: f64::try_from(&terms.kl_penalty_loss)?,
            clip_fraction: f64::try_from(&terms.clip_fraction)?,
            importance_ratio_mean: f64::try_from(&terms.importance_ratio_mean)?,
            entropy: f64::try_from(&terms.entropy_mean)?,
            kl_divergence: f64::try_from(&terms.kl_mean)?,
            num_epochs: 1,
        })
    }

    /// Add another report to this one
    pub fn add(&mut self, other: &LossInfo) {
        self.total_loss += other.total_loss;
        self.policy_gradient_loss += other.policy_gradient_loss;
        self.value_estimation_loss += other.value_estimation_loss;
        self.l2_regularization_loss += other.l2_regularization_loss;
        self.entropy_regularization_loss += other.entropy_regularization_loss;
        self.kl_penalty_loss += other.kl_penalty_loss;
        self.clip_fraction += other.clip_fraction;
        self.importance_ratio_mean += other.importance_ratio_mean;
        self.entropy += other.entropy;
        self.kl_divergence += other.kl_divergence;
        self.num_epochs += other.num_epochs;
    }

    /// Per-epoch average of a summed report
    pub fn average(&self) -> Self {
        let scale = self.num_epochs as f64;
        if scale == 0.0 {
            return Self::zeros();
        }

        Self {
            total_loss: self.total_loss / scale,
            policy_gradient_loss: self.policy_gradient_loss / scale,
            value_estimation_loss: self.value_estimation_loss / scale,
            l2_regularization_loss: self.l2_regularization_loss / scale,
            entropy_regularization_loss: self.entropy_regularization_loss / scale,
            kl_penalty_loss: self.kl_penalty_loss / scale,
            clip_fraction: self.clip_fraction / scale,
            importance_ratio_mean: self.importance_ratio_mean / scale,
            entropy: self.entropy / scale,
            kl_divergence: self.kl_divergence / scale,
            num_epochs: 1,
        }
    }
}

impl AddAssign<&LossInfo> for LossInfo {
    fn add_assign(&mut self, other: &LossInfo) {
        self.add(other);
    }
}

/// Result of one training call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStepOutput {
    /// Losses summed over every epoch of the call
    pub loss: LossInfo,

    /// Losses of the final epoch
    pub last_epoch: LossInfo,

    /// Masked mean KL from the collection policy to the updated policy,
    /// measured after the final weight update
    pub mean_kl: f64,

    /// β after this call's update, `None` when the controller is disabled
    pub adaptive_kl_beta: Option<f64>,

    /// Completed training calls, including this one
    ///
    /// Counts calls, not optimizer steps; one call applies `num_epochs`
    /// updates, counted by [`TorchOptimizer::num_steps`].
    ///
    /// [`TorchOptimizer::num_steps`]: super::optimizer::TorchOptimizer::num_steps
    pub train_step: u64,
}
