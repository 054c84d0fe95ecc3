//! Network collaborators consumed by the training core
//!
//! The actor and value networks are supplied by the caller. The training
//! core only evaluates them (once for the initial value predictions and
//! once per epoch) and reads their regularizable weights.

use anyhow::Result;
use tch::{nn, Tensor};

use super::distribution::{DistributionKind, DistributionParams};

/// Maps observations to action-distribution parameters
pub trait ActorNetwork {
    /// Distribution family emitted for each action component, in order
    fn distribution_kinds(&self) -> Vec<DistributionKind>;

    /// Recurrent state for a fresh batch, `None` for feed-forward networks
    fn initial_state(&self, _batch_size: i64) -> Option<Tensor> {
        None
    }

    /// Evaluate the network at its current weights
    ///
    /// # Arguments
    /// * `observation` - Normalized observations `[batch, time, obs...]`
    /// * `state` - Recurrent state, if any
    ///
    /// # Returns
    /// One parameter set per action component, each `[batch, time, ...]`,
    /// and the next recurrent state
    fn evaluate(
        &self,
        observation: &Tensor,
        state: Option<&Tensor>,
    ) -> Result<(Vec<DistributionParams>, Option<Tensor>)>;

    /// Weights subject to L2 regularization (kernels, not biases)
    fn regularizable_weights(&self) -> Vec<Tensor>;
}

/// Maps observations to state-value estimates
pub trait ValueNetwork {
    /// Recurrent state for a fresh batch, `None` for feed-forward networks
    fn initial_state(&self, _batch_size: i64) -> Option<Tensor> {
        None
    }

    /// Evaluate the network at its current weights
    ///
    /// # Arguments
    /// * `observation` - Normalized observations `[batch, time, obs...]`
    /// * `step_type` - Step types `[batch, time]`
    /// * `state` - Recurrent state, if any
    ///
    /// # Returns
    /// Value estimates `[batch, time]` and the next recurrent state
    fn evaluate(
        &self,
        observation: &Tensor,
        step_type: &Tensor,
        state: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)>;

    /// Weights subject to L2 regularization (kernels, not biases)
    fn regularizable_weights(&self) -> Vec<Tensor>;
}

/// Kernel (non-bias) variables of a var store under `prefix`, ordered by name
///
/// Helper for implementing `regularizable_weights` on `tch::nn` models that
/// share one var store. An empty prefix selects every kernel.
pub fn kernel_weights(vs: &nn::VarStore, prefix: &str) -> Vec<Tensor> {
    let mut variables: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .filter(|(name, _)| name.starts_with(prefix) && name.ends_with("weight"))
        .collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    variables.into_iter().map(|(_, tensor)| tensor).collect()
}
