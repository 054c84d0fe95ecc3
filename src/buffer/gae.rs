//! Return and advantage estimation
//!
//! This module computes discounted Monte Carlo returns, empirical or
//! Generalized Advantage Estimation (GAE) advantages, and optional
//! TD(λ) return targets for a batch of transitions.
//!
//! # Mathematical Formula
//! ```text
//! R_t = r_t + d_t * R_{t+1}                  R_T = 0
//! δ_t = r_t + d_t * V_{t+1} - V_t
//! A_t = δ_t + d_t * λ * A_{t+1}              A_T = 0
//! ```
//!
//! Where:
//! - `d_t` is the environment discount times γ, zeroed at episode ends
//! - `V_t` is the value estimate at time t (one extra trailing step supplies
//!   the bootstrap `V_T`)
//! - λ is the GAE parameter

use tch::{Kind, Tensor};

use super::{mask::episode_mask, trajectory::TimeStep};
use crate::{
    error::{PpoError, Result},
    utils::normalize::StreamingNormalizer,
};

/// Epsilon added to the advantage standard deviation
pub const ADVANTAGE_EPSILON: f64 = 1e-8;

/// Discounted Monte Carlo returns
///
/// Reverse-time scan `R[t] = rewards[t] + discounts[t] * R[t + 1]` seeded
/// with zero. Discounts must already be zero at episode ends.
///
/// # Arguments
/// * `rewards` - Rewards `[batch, time]`
/// * `discounts` - Discounts `[batch, time]`
pub fn compute_returns(rewards: &Tensor, discounts: &Tensor) -> Result<Tensor> {
    check_batch_time("rewards", rewards)?;
    check_same_shape("rewards", rewards, "discounts", discounts)?;

    Ok(reverse_discounted_scan(rewards, discounts, 1.0))
}

/// Per-step advantages
///
/// With `gae_lambda = None` the empirical advantage `returns - V` is used,
/// otherwise GAE with the given λ.
///
/// # Arguments
/// * `rewards` - Rewards `[batch, time]`
/// * `returns` - Returns `[batch, time]`
/// * `discounts` - Discounts `[batch, time]`, zero at episode ends
/// * `value_preds` - Value estimates `[batch, time + 1]`
/// * `gae_lambda` - λ for GAE, or `None` for empirical advantages
pub fn compute_advantages(
    rewards: &Tensor,
    returns: &Tensor,
    discounts: &Tensor,
    value_preds: &Tensor,
    gae_lambda: Option<f64>,
) -> Result<Tensor> {
    check_batch_time("rewards", rewards)?;
    check_same_shape("rewards", rewards, "discounts", discounts)?;
    check_same_shape("rewards", rewards, "returns", returns)?;

    let (batch, steps) = (rewards.size()[0], rewards.size()[1]);
    let value_size = value_preds.size();
    if value_size != [batch, steps + 1] {
        return Err(PpoError::validation(format!(
            "value_preds must have shape [{}, {}] (one bootstrap step past rewards), got {:?}",
            batch,
            steps + 1,
            value_size
        )));
    }

    let values = value_preds.narrow(1, 0, steps);
    let next_values = value_preds.narrow(1, 1, steps);

    match gae_lambda {
        None => Ok(returns - &values),
        Some(lambda) => {
            let deltas = rewards + discounts * &next_values - &values;
            Ok(reverse_discounted_scan(&deltas, discounts, lambda))
        }
    }
}

/// Normalize advantages with the batch's own mean and variance
///
/// Computes `(A - mean(A)) / (std(A) + epsilon)` over every element.
pub fn normalize_advantages(advantages: &Tensor, variance_epsilon: f64) -> Tensor {
    let kind = advantages.kind();
    let mean = advantages.mean(kind);
    let var = (advantages - &mean).square().mean(kind);
    (advantages - mean) / (var.sqrt() + variance_epsilon)
}

/// Reverse scan `out[t] = x[t] + scale * d[t] * out[t + 1]`, `out[T] = 0`
fn reverse_discounted_scan(x: &Tensor, discounts: &Tensor, scale: f64) -> Tensor {
    let num_steps = x.size()[1];
    if num_steps == 0 {
        return x.zeros_like();
    }

    let mut next = x.select(1, 0).zeros_like();
    let mut outputs = Vec::with_capacity(num_steps as usize);

    // Iterate backwards through time
    for t in (0..num_steps).rev() {
        next = x.select(1, t) + discounts.select(1, t) * scale * &next;
        outputs.push(next.shallow_clone());
    }

    outputs.reverse();
    Tensor::stack(&outputs, 1)
}

fn check_batch_time(name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.dim() != 2 {
        return Err(PpoError::validation(format!(
            "{} must be [batch, time], got shape {:?}",
            name,
            tensor.size()
        )));
    }
    Ok(())
}

fn check_same_shape(a_name: &str, a: &Tensor, b_name: &str, b: &Tensor) -> Result<()> {
    if a.size() != b.size() {
        return Err(PpoError::validation(format!(
            "{} should have the same shape as {}: {:?} vs {:?}",
            a_name,
            b_name,
            a.size(),
            b.size()
        )));
    }
    Ok(())
}

/// Returns plus advantages for one training call
#[derive(Debug)]
pub struct ReturnsAndAdvantages {
    /// Value-function targets `[batch, time]`
    pub returns: Tensor,

    /// Raw advantages `[batch, time]`
    pub advantages: Tensor,

    /// Advantages normalized over the whole batch `[batch, time]`
    pub normalized_advantages: Tensor,
}

/// Computes returns and normalized advantages from transitions
///
/// Default values follow common PPO settings; use the builder methods
/// to change them.
#[derive(Debug, Clone)]
pub struct ReturnEstimator {
    discount_factor: f64,
    lambda_value: f64,
    use_gae: bool,
    use_td_lambda_return: bool,
    reward_norm_clipping: f64,
}

impl Default for ReturnEstimator {
    fn default() -> Self {
        Self {
            discount_factor: 0.99,
            lambda_value: 0.95,
            use_gae: false,
            use_td_lambda_return: false,
            reward_norm_clipping: 10.0,
        }
    }
}

impl ReturnEstimator {
    /// Create an estimator with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set discount factor (gamma)
    pub fn discount_factor(mut self, gamma: f64) -> Self {
        self.discount_factor = gamma;
        self
    }

    /// Set GAE lambda
    pub fn lambda_value(mut self, lambda: f64) -> Self {
        self.lambda_value = lambda;
        self
    }

    /// Use GAE instead of empirical advantages
    pub fn use_gae(mut self, enabled: bool) -> Self {
        self.use_gae = enabled;
        self
    }

    /// Use TD(λ) returns as value targets (only honored together with GAE)
    pub fn use_td_lambda_return(mut self, enabled: bool) -> Self {
        self.use_td_lambda_return = enabled;
        self
    }

    /// Set the symmetric clip for normalized rewards
    pub fn reward_norm_clipping(mut self, clip: f64) -> Self {
        self.reward_norm_clipping = clip;
        self
    }

    /// Whether TD(λ) returns will actually be produced
    pub fn produces_td_lambda_returns(&self) -> bool {
        self.use_td_lambda_return && self.use_gae
    }

    /// Compute returns and normalized advantages
    ///
    /// # Arguments
    /// * `next_time_step` - The `t + 1` side of the transitions, supplying
    ///   rewards and discounts `[batch, time]`
    /// * `value_preds` - Value estimates `[batch, time + 1]`
    /// * `reward_normalizer` - Scales rewards (no mean-centering) when given
    pub fn compute_return_and_advantage(
        &self,
        next_time_step: &TimeStep,
        value_preds: &Tensor,
        reward_normalizer: Option<&StreamingNormalizer>,
    ) -> Result<ReturnsAndAdvantages> {
        check_same_shape(
            "rewards",
            &next_time_step.reward,
            "discounts",
            &next_time_step.discount,
        )?;

        // Restart the cumulative sums at the end of each episode
        let discounts =
            &next_time_step.discount * self.discount_factor * episode_mask(next_time_step);

        let rewards = match reward_normalizer {
            Some(normalizer) => {
                normalizer.normalize(&next_time_step.reward, false, self.reward_norm_clipping)?
            }
            None => next_time_step.reward.shallow_clone(),
        };
        let rewards = rewards.to_kind(Kind::Float);
        let discounts = discounts.to_kind(Kind::Float);
        let value_preds = value_preds.to_kind(Kind::Float);

        let returns = compute_returns(&rewards, &discounts)?;
        let gae_lambda = self.use_gae.then_some(self.lambda_value);
        let advantages =
            compute_advantages(&rewards, &returns, &discounts, &value_preds, gae_lambda)?;
        let normalized_advantages = normalize_advantages(&advantages, ADVANTAGE_EPSILON);

        let returns = if self.produces_td_lambda_returns() {
            let steps = rewards.size()[1];
            &advantages + value_preds.narrow(1, 0, steps)
        } else {
            returns
        };

        Ok(ReturnsAndAdvantages { returns, advantages, normalized_advantages })
    }
}
