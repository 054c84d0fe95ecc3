//! Validity and episode masks for transitions

use tch::{Kind, Tensor};

use super::trajectory::{StepType, TimeStep};

/// Per-transition validity mask `[batch, time]` of 0.0 / 1.0
///
/// A transition is invalid (0.0) when its next step starts a new episode,
/// i.e. it bridges two episodes, or when it belongs to an episode that has
/// not ended by the last step of its row.
///
/// # Arguments
/// * `next_time_step` - The `t + 1` side of the transitions
/// * `allow_partial_episodes` - Keep unfinished tail episodes valid
pub fn make_timestep_mask(next_time_step: &TimeStep, allow_partial_episodes: bool) -> Tensor {
    if allow_partial_episodes {
        return next_time_step.discount.ones_like().to_kind(Kind::Float);
    }

    // Count of episode ends at or after each step, per row
    let ends_remaining = next_time_step
        .is_last()
        .to_kind(Kind::Float)
        .flip([1])
        .cumsum(1, Kind::Float)
        .flip([1]);
    let episode_is_complete = ends_remaining.gt(0.0);
    let not_between_episodes = next_time_step.is_first().logical_not();

    episode_is_complete.logical_and(&not_between_episodes).to_kind(Kind::Float)
}

/// 0.0 where the next step ends an episode, 1.0 elsewhere
///
/// Multiplied into the discounts so that return accumulation restarts at
/// every episode boundary.
pub fn episode_mask(next_time_step: &TimeStep) -> Tensor {
    next_time_step.step_type.ne(StepType::Last.code()).to_kind(Kind::Float)
}
