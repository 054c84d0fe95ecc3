//! Shared helpers for integration tests: small tch networks implementing
//! the collaborator traits, optimizer stubs and trajectory builders.

#![allow(dead_code)]

use std::cell::RefCell;

use anyhow::Result;
use ppo_learner::{
    buffer::{PolicyStep, TimeStep, Trajectory},
    policy::{kernel_weights, ActorNetwork, DistributionKind, DistributionParams, ValueNetwork},
    train::{Optimizer, PpoAgent},
};
use tch::{
    nn::{self, Module},
    Device, Kind, Tensor,
};

pub const FIRST: i64 = 0;
pub const MID: i64 = 1;
pub const LAST: i64 = 2;

/// Install a test-friendly tracing subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One hidden tanh layer followed by a logits head
pub struct CategoricalActor {
    hidden: nn::Linear,
    logits: nn::Linear,
    kernels: Vec<Tensor>,
}

impl CategoricalActor {
    pub fn new(vs: &nn::VarStore, obs_dim: i64, num_actions: i64, hidden_dim: i64) -> Self {
        let root = vs.root() / "actor";
        let hidden = nn::linear(&root / "fc1", obs_dim, hidden_dim, Default::default());
        let logits = nn::linear(&root / "logits", hidden_dim, num_actions, Default::default());
        Self { hidden, logits, kernels: kernel_weights(vs, "actor.") }
    }

    pub fn logits(&self, observation: &Tensor) -> Tensor {
        self.logits.forward(&self.hidden.forward(observation).tanh())
    }
}

impl ActorNetwork for CategoricalActor {
    fn distribution_kinds(&self) -> Vec<DistributionKind> {
        vec![DistributionKind::Categorical]
    }

    fn evaluate(
        &self,
        observation: &Tensor,
        _state: Option<&Tensor>,
    ) -> Result<(Vec<DistributionParams>, Option<Tensor>)> {
        Ok((vec![DistributionParams::categorical(self.logits(observation))], None))
    }

    fn regularizable_weights(&self) -> Vec<Tensor> {
        shallow_clones(&self.kernels)
    }
}

/// Linear mean head with a state-independent learned log standard deviation
pub struct GaussianActor {
    loc: nn::Linear,
    log_std: Tensor,
    kernels: Vec<Tensor>,
}

impl GaussianActor {
    pub fn new(vs: &nn::VarStore, obs_dim: i64, action_dim: i64) -> Self {
        let root = vs.root() / "actor";
        let loc = nn::linear(&root / "loc", obs_dim, action_dim, Default::default());
        let log_std = root.zeros("log_std", &[action_dim]);
        Self { loc, log_std, kernels: kernel_weights(vs, "actor.") }
    }

    pub fn params(&self, observation: &Tensor) -> DistributionParams {
        let loc = self.loc.forward(observation);
        let scale = self.log_std.exp().expand_as(&loc);
        DistributionParams::normal(loc, scale)
    }
}

impl ActorNetwork for GaussianActor {
    fn distribution_kinds(&self) -> Vec<DistributionKind> {
        vec![DistributionKind::Normal]
    }

    fn evaluate(
        &self,
        observation: &Tensor,
        _state: Option<&Tensor>,
    ) -> Result<(Vec<DistributionParams>, Option<Tensor>)> {
        Ok((vec![self.params(observation)], None))
    }

    fn regularizable_weights(&self) -> Vec<Tensor> {
        shallow_clones(&self.kernels)
    }
}

/// Actor wrapper recording the largest absolute observation it was fed
pub struct RecordingActor<A> {
    pub inner: A,
    pub max_abs_observation: RefCell<Vec<f64>>,
}

impl<A> RecordingActor<A> {
    pub fn new(inner: A) -> Self {
        Self { inner, max_abs_observation: RefCell::new(Vec::new()) }
    }
}

impl<A: ActorNetwork> ActorNetwork for RecordingActor<A> {
    fn distribution_kinds(&self) -> Vec<DistributionKind> {
        self.inner.distribution_kinds()
    }

    fn evaluate(
        &self,
        observation: &Tensor,
        state: Option<&Tensor>,
    ) -> Result<(Vec<DistributionParams>, Option<Tensor>)> {
        let max_abs = f64::try_from(&observation.abs().max())?;
        self.max_abs_observation.borrow_mut().push(max_abs);
        self.inner.evaluate(observation, state)
    }

    fn regularizable_weights(&self) -> Vec<Tensor> {
        self.inner.regularizable_weights()
    }
}

/// Single linear layer producing one value per step
pub struct LinearValue {
    fc: nn::Linear,
    kernels: Vec<Tensor>,
}

impl LinearValue {
    pub fn new(vs: &nn::VarStore, obs_dim: i64) -> Self {
        let fc = nn::linear(vs.root() / "value" / "fc", obs_dim, 1, Default::default());
        Self { fc, kernels: kernel_weights(vs, "value.") }
    }
}

impl ValueNetwork for LinearValue {
    fn evaluate(
        &self,
        observation: &Tensor,
        _step_type: &Tensor,
        _state: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        Ok((self.fc.forward(observation).squeeze_dim(-1), None))
    }

    fn regularizable_weights(&self) -> Vec<Tensor> {
        shallow_clones(&self.kernels)
    }
}

/// Value network returning a malformed `[batch]` output
pub struct BrokenValue;

impl ValueNetwork for BrokenValue {
    fn evaluate(
        &self,
        observation: &Tensor,
        _step_type: &Tensor,
        _state: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        Ok((Tensor::zeros([observation.size()[0]], (Kind::Float, Device::Cpu)), None))
    }

    fn regularizable_weights(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Optimizer stub that leaves every weight untouched
#[derive(Debug, Default)]
pub struct StationaryOptimizer {
    pub calls: usize,
}

impl Optimizer for StationaryOptimizer {
    fn apply(&mut self, _total_loss: &Tensor) -> Result<()> {
        self.calls += 1;
        Ok(())
    }
}

fn shallow_clones(tensors: &[Tensor]) -> Vec<Tensor> {
    tensors.iter().map(Tensor::shallow_clone).collect()
}

/// Step types `[batch, time]` from a flat row-major slice
pub fn step_types(values: &[i64], batch: i64) -> Tensor {
    Tensor::from_slice(values).view([batch, values.len() as i64 / batch])
}

/// Build a trajectory whose stored distribution parameters come from the
/// agent's current actor, evaluated on observations normalized the way the
/// agent normalizes them
pub fn collect<A, V, O>(
    agent: &PpoAgent<A, V, O>,
    observation: Tensor,
    action: Tensor,
    reward: Tensor,
    step_type: Tensor,
) -> Trajectory
where
    A: ActorNetwork,
    V: ValueNetwork,
    O: Optimizer,
{
    let normalized = agent.normalize_observation(&observation).unwrap();
    let (info, _) = tch::no_grad(|| agent.actor().evaluate(&normalized, None)).unwrap();
    let info = info.iter().map(DistributionParams::detach).collect();

    let discount = Tensor::ones(reward.size(), (Kind::Float, Device::Cpu));
    Trajectory::new(
        TimeStep { step_type, reward, discount, observation },
        PolicyStep { action: vec![action], state: None, info },
    )
    .unwrap()
}
