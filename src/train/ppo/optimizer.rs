//! Weight-update collaborator
//!
//! The training core hands each epoch's total loss to an [`Optimizer`]
//! and relies on the update having taken effect before the next epoch
//! evaluates the networks again.

use anyhow::Result;
use tch::{nn, Tensor};

use super::config::PPOConfig;

/// Applies one weight update from a scalar loss
pub trait Optimizer {
    /// Backpropagate `total_loss` and update the trainable weights
    fn apply(&mut self, total_loss: &Tensor) -> Result<()>;
}

/// [`Optimizer`] backed by a `tch::nn::Optimizer`
///
/// Performs zero-grad, backward, optional global gradient-norm clipping
/// and a step.
#[derive(Debug)]
pub struct TorchOptimizer {
    optimizer: nn::Optimizer,
    max_grad_norm: Option<f64>,
    num_steps: usize,
}

impl TorchOptimizer {
    /// Wrap a configured optimizer
    pub fn new(optimizer: nn::Optimizer) -> Self {
        Self { optimizer, max_grad_norm: None, num_steps: 0 }
    }

    /// Build an Adam optimizer over every trainable variable of `vs`
    pub fn adam(vs: &nn::VarStore, learning_rate: f64) -> Result<Self> {
        let optimizer = nn::OptimizerConfig::build(nn::Adam::default(), vs, learning_rate)?;
        Ok(Self::new(optimizer))
    }

    /// Build an optimizer over `vs` that clips gradients as `config` asks
    ///
    /// # Arguments
    ///
    /// * `optimizer_config` - Optimizer family, e.g. `nn::Adam::default()`
    /// * `vs` - Variables to train
    /// * `learning_rate` - Step size
    /// * `config` - Supplies `gradient_clipping`
    pub fn from_config<C: nn::OptimizerConfig>(
        optimizer_config: C,
        vs: &nn::VarStore,
        learning_rate: f64,
        config: &PPOConfig,
    ) -> Result<Self> {
        let optimizer = optimizer_config.build(vs, learning_rate)?;
        Ok(Self::new(optimizer).with_gradient_clipping(config.gradient_clipping))
    }

    /// Clip the global gradient norm before each step
    pub fn with_gradient_clipping(mut self, max_grad_norm: Option<f64>) -> Self {
        self.max_grad_norm = max_grad_norm;
        self
    }

    /// Number of updates applied so far
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }
}

impl Optimizer for TorchOptimizer {
    fn apply(&mut self, total_loss: &Tensor) -> Result<()> {
        self.optimizer.zero_grad();
        total_loss.f_backward()?;

        if let Some(max_norm) = self.max_grad_norm {
            self.optimizer.clip_grad_norm(max_norm);
        }

        self.optimizer.step();
        self.num_steps += 1;
        Ok(())
    }
}
