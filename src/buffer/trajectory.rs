//! Trajectory storage and transition slicing
//!
//! A [`Trajectory`] holds `L + 1` consecutive steps per batch row. Training
//! works on [`Transition`]s, which pair step `t` with step `t + 1` and so
//! carry `L` steps per row.
//!
//! # Layout
//!
//! Every tensor uses a `[batch, time, ...]` layout:
//! - `batch`: Number of independent rows (environments or episode chunks)
//! - `time`: Steps within a row

use tch::Tensor;

use crate::{
    error::{PpoError, Result},
    policy::distribution::DistributionParams,
};

/// Position of a step within its episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum StepType {
    /// First step of an episode
    First = 0,

    /// Any step between the first and the last
    Mid = 1,

    /// Final step of an episode
    Last = 2,
}

impl StepType {
    /// Integer code stored in `step_type` tensors
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Environment output for a batch of steps
#[derive(Debug)]
pub struct TimeStep {
    /// Step types `[batch, time]` (int64 codes of [`StepType`])
    pub step_type: Tensor,

    /// Rewards `[batch, time]`
    pub reward: Tensor,

    /// Environment discounts in `[0, 1]`, `[batch, time]`
    pub discount: Tensor,

    /// Observations `[batch, time, obs...]`
    pub observation: Tensor,
}

impl TimeStep {
    /// Boolean tensor marking FIRST steps
    pub fn is_first(&self) -> Tensor {
        self.step_type.eq(StepType::First.code())
    }

    /// Boolean tensor marking LAST steps
    pub fn is_last(&self) -> Tensor {
        self.step_type.eq(StepType::Last.code())
    }

    /// Leading `[batch, time]` shape
    pub fn outer_shape(&self) -> Vec<i64> {
        self.step_type.size()
    }

    fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        Self {
            step_type: f(&self.step_type),
            reward: f(&self.reward),
            discount: f(&self.discount),
            observation: f(&self.observation),
        }
    }

    fn validate(&self, outer: &[i64]) -> Result<()> {
        check_exact("step_type", &self.step_type, outer)?;
        check_exact("reward", &self.reward, outer)?;
        check_exact("discount", &self.discount, outer)?;
        check_leading("observation", &self.observation, outer)
    }
}

/// Agent output for a batch of steps
#[derive(Debug)]
pub struct PolicyStep {
    /// Actions, one tensor per action component `[batch, time, ...]`
    pub action: Vec<Tensor>,

    /// Recurrent state at collection time, if any
    pub state: Option<Tensor>,

    /// Action-distribution parameters captured at collection time,
    /// one entry per action component
    pub info: Vec<DistributionParams>,
}

impl PolicyStep {
    fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        Self {
            action: self.action.iter().map(&f).collect(),
            state: self.state.as_ref().map(Tensor::shallow_clone),
            info: self.info.iter().map(|params| params.map(&f)).collect(),
        }
    }

    fn validate(&self, outer: &[i64]) -> Result<()> {
        if self.action.is_empty() {
            return Err(PpoError::validation("policy step has no action components"));
        }
        if self.action.len() != self.info.len() {
            return Err(PpoError::validation(format!(
                "{} action components but {} distribution parameter sets",
                self.action.len(),
                self.info.len()
            )));
        }
        for (i, action) in self.action.iter().enumerate() {
            check_leading(&format!("action[{}]", i), action, outer)?;
        }
        for (i, params) in self.info.iter().enumerate() {
            for (j, tensor) in params.tensors.iter().enumerate() {
                check_leading(&format!("info[{}].param[{}]", i, j), tensor, outer)?;
            }
        }
        Ok(())
    }
}

/// Consecutive steps collected by the data-collection policy
///
/// The time dimension is one longer than the number of transitions it
/// yields; the extra step supplies the "next" values of the last transition.
#[derive(Debug)]
pub struct Trajectory {
    /// Environment side of every step
    pub time_step: TimeStep,

    /// Agent side of every step
    pub policy_step: PolicyStep,
}

impl Trajectory {
    /// Create a trajectory, validating that all tensors share `[batch, time]`
    pub fn new(time_step: TimeStep, policy_step: PolicyStep) -> Result<Self> {
        let trajectory = Self { time_step, policy_step };
        trajectory.validate()?;
        Ok(trajectory)
    }

    /// Check that every tensor agrees on the `[batch, time]` outer shape
    pub fn validate(&self) -> Result<()> {
        let outer = self.time_step.outer_shape();
        if outer.len() != 2 {
            return Err(PpoError::validation(format!(
                "step_type must be [batch, time], got shape {:?}",
                outer
            )));
        }
        if outer[1] < 2 {
            return Err(PpoError::validation(format!(
                "trajectory needs at least 2 time steps to form a transition, got {}",
                outer[1]
            )));
        }
        self.time_step.validate(&outer)?;
        self.policy_step.validate(&outer)
    }

    /// `(batch, time)` of this trajectory
    pub fn outer_shape(&self) -> (i64, i64) {
        let outer = self.time_step.outer_shape();
        (outer[0], outer[1])
    }

    /// Split into aligned `(t, t + 1)` transitions
    ///
    /// Returns transitions with one fewer time step than the trajectory.
    pub fn to_transitions(&self) -> Result<Transition> {
        self.validate()?;
        let (_, time) = self.outer_shape();
        let len = time - 1;

        let head = |t: &Tensor| t.narrow(1, 0, len);
        let tail = |t: &Tensor| t.narrow(1, 1, len);

        Ok(Transition {
            time_step: self.time_step.map(head),
            policy_step: self.policy_step.map(head),
            next_time_step: self.time_step.map(tail),
        })
    }
}

/// A `(time_step, policy_step, next_time_step)` triple
#[derive(Debug)]
pub struct Transition {
    /// Steps `t`
    pub time_step: TimeStep,

    /// Actions taken at `t` and the distribution that produced them
    pub policy_step: PolicyStep,

    /// Steps `t + 1`: rewards and discounts received for the action at `t`
    pub next_time_step: TimeStep,
}

fn check_exact(name: &str, tensor: &Tensor, outer: &[i64]) -> Result<()> {
    let size = tensor.size();
    if size != outer {
        return Err(PpoError::validation(format!(
            "{} must have shape {:?}, got {:?}",
            name, outer, size
        )));
    }
    Ok(())
}

fn check_leading(name: &str, tensor: &Tensor, outer: &[i64]) -> Result<()> {
    let size = tensor.size();
    if size.len() < outer.len() || size[..outer.len()] != outer[..] {
        return Err(PpoError::validation(format!(
            "{} must start with outer shape {:?}, got {:?}",
            name, outer, size
        )));
    }
    Ok(())
}
