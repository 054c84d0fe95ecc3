//! PPO agent: one training call from a trajectory batch
//!
//! A call runs the following steps in order:
//! 1. Slice the trajectory into transitions and build the validity mask
//! 2. Normalize observations with the current (pre-call) statistics
//! 3. Predict values under the current weights and estimate returns
//!    and normalized advantages
//! 4. Run `num_epochs` ordered optimization passes
//! 5. Measure KL between the collection policy and the updated policy and
//!    update the adaptive β
//! 6. Fold this batch's raw observations and rewards into the normalizers

use tch::{Kind, Tensor};
use tracing::{info, warn};

use super::{
    config::PPOConfig,
    kl::AdaptiveKlController,
    loss::{masked_mean, LossAssembler, LossInputs},
    optimizer::Optimizer,
    scheduler::EpochScheduler,
    stats::{LossInfo, TrainStepOutput},
};
use crate::{
    buffer::{
        gae::ReturnEstimator,
        mask::make_timestep_mask,
        trajectory::{Trajectory, Transition},
    },
    error::{PpoError, Result},
    policy::{
        distribution::{ActionDistribution, ActionSpec},
        network::{ActorNetwork, ValueNetwork},
    },
    utils::{
        normalize::{NormalizerStats, StreamingNormalizer, DEFAULT_VARIANCE_EPSILON},
        numerics::check_numerics,
    },
};

/// Outer dimensions reduced by normalizer updates
const BATCH_TIME_DIMS: [i64; 2] = [0, 1];

/// PPO agent owning the networks, optimizer and cross-call state
///
/// The reward/observation normalizers and the adaptive β are read as a
/// snapshot during a call and written exactly once at its end. Calls take
/// `&mut self` and therefore never interleave.
#[derive(Debug)]
pub struct PpoAgent<A, V, O> {
    config: PPOConfig,
    action_spec: ActionSpec,
    actor: A,
    value_network: V,
    optimizer: O,
    observation_normalizer: Option<StreamingNormalizer>,
    reward_normalizer: Option<StreamingNormalizer>,
    kl_controller: Option<AdaptiveKlController>,
    return_estimator: ReturnEstimator,
    loss_assembler: LossAssembler,
    scheduler: EpochScheduler,
    train_step: u64,
}

impl<A, V, O> PpoAgent<A, V, O>
where
    A: ActorNetwork,
    V: ValueNetwork,
    O: Optimizer,
{
    /// Create a new PPO agent
    ///
    /// # Arguments
    ///
    /// * `config` - PPO configuration parameters
    /// * `action_spec` - Spec of the (possibly structured) action
    /// * `observation_shape` - Shape of a single observation
    /// * `actor` - Actor network
    /// * `value_network` - Value network
    /// * `optimizer` - Applies weight updates for both networks
    ///
    /// Fails with a configuration error if the config is invalid or the
    /// actor's distribution families cannot serve `action_spec`.
    pub fn new(
        config: PPOConfig,
        action_spec: ActionSpec,
        observation_shape: &[i64],
        actor: A,
        value_network: V,
        optimizer: O,
    ) -> Result<Self> {
        config.validate()?;
        action_spec.check_distribution_kinds(&actor.distribution_kinds())?;

        if config.use_td_lambda_return && !config.use_gae {
            warn!("use_td_lambda_return requires use_gae; falling back to Monte Carlo returns");
        }

        let observation_normalizer = config
            .normalize_observations
            .then(|| StreamingNormalizer::new(observation_shape));
        let reward_normalizer = config.normalize_rewards.then(|| StreamingNormalizer::new(&[]));

        let return_estimator = ReturnEstimator::new()
            .discount_factor(config.discount_factor)
            .lambda_value(config.lambda_value)
            .use_gae(config.use_gae)
            .use_td_lambda_return(config.use_td_lambda_return)
            .reward_norm_clipping(config.reward_norm_clipping);
        let scheduler =
            EpochScheduler::new(config.num_epochs).with_debug_summaries(config.debug_summaries);

        Ok(Self {
            kl_controller: AdaptiveKlController::from_config(&config),
            loss_assembler: LossAssembler::from_config(&config),
            return_estimator,
            scheduler,
            observation_normalizer,
            reward_normalizer,
            config,
            action_spec,
            actor,
            value_network,
            optimizer,
            train_step: 0,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &PPOConfig {
        &self.config
    }

    /// Get the action spec
    pub fn action_spec(&self) -> &ActionSpec {
        &self.action_spec
    }

    /// Get reference to the actor network
    pub fn actor(&self) -> &A {
        &self.actor
    }

    /// Get reference to the value network
    pub fn value_network(&self) -> &V {
        &self.value_network
    }

    /// Get reference to the optimizer
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Current adaptive β, `None` when the controller is disabled
    pub fn adaptive_kl_beta(&self) -> Option<f64> {
        self.kl_controller.as_ref().map(AdaptiveKlController::beta)
    }

    /// Number of completed training calls
    pub fn train_step(&self) -> u64 {
        self.train_step
    }

    /// Observation normalizer, if enabled
    pub fn observation_normalizer(&self) -> Option<&StreamingNormalizer> {
        self.observation_normalizer.as_ref()
    }

    /// Reward normalizer, if enabled
    pub fn reward_normalizer(&self) -> Option<&StreamingNormalizer> {
        self.reward_normalizer.as_ref()
    }

    /// Replace the observation statistics, e.g. from a checkpoint
    pub fn restore_observation_normalizer(&mut self, stats: &NormalizerStats) -> Result<()> {
        Self::restore(&mut self.observation_normalizer, stats, "observation")
    }

    /// Replace the reward statistics, e.g. from a checkpoint
    pub fn restore_reward_normalizer(&mut self, stats: &NormalizerStats) -> Result<()> {
        Self::restore(&mut self.reward_normalizer, stats, "reward")
    }

    fn restore(
        slot: &mut Option<StreamingNormalizer>,
        stats: &NormalizerStats,
        name: &str,
    ) -> Result<()> {
        let current = slot.as_ref().ok_or_else(|| {
            PpoError::configuration(format!("{} normalization is disabled", name))
        })?;
        if current.shape() != stats.shape.as_slice() {
            return Err(PpoError::validation(format!(
                "{} normalizer has shape {:?}, stats have {:?}",
                name,
                current.shape(),
                stats.shape
            )));
        }
        *slot = Some(StreamingNormalizer::from_stats(stats, DEFAULT_VARIANCE_EPSILON)?);
        Ok(())
    }

    /// Normalize observations the way the networks see them
    ///
    /// Mean-centered and clipped to `observation_norm_clipping`; identity
    /// when observation normalization is disabled.
    pub fn normalize_observation(&self, observation: &Tensor) -> Result<Tensor> {
        match &self.observation_normalizer {
            Some(normalizer) => {
                normalizer.normalize(observation, true, self.config.observation_norm_clipping)
            }
            None => Ok(observation.shallow_clone()),
        }
    }

    /// Run one training call on a trajectory batch
    ///
    /// # Arguments
    ///
    /// * `trajectory` - `[batch, L + 1]` steps from the collection policy
    ///
    /// # Returns
    /// Losses summed over all epochs plus the final KL and β
    pub fn train(&mut self, trajectory: &Trajectory) -> Result<TrainStepOutput> {
        let transitions = trajectory.to_transitions()?;
        let (batch_size, num_steps) = transitions_shape(&transitions);
        let outer_shape = [batch_size, num_steps];

        let mask =
            make_timestep_mask(&transitions.next_time_step, self.config.allow_partial_episodes);

        // Snapshot normalization: statistics are not touched until the end
        let observations = self.normalize_observation(&trajectory.time_step.observation)?;
        let step_observations = observations.narrow(1, 0, num_steps);

        let value_preds = tch::no_grad(|| {
            evaluate_values(
                &self.value_network,
                &observations,
                &trajectory.time_step.step_type,
                [batch_size, num_steps + 1],
            )
        })?;
        let estimates = self.return_estimator.compute_return_and_advantage(
            &transitions.next_time_step,
            &value_preds,
            self.reward_normalizer.as_ref(),
        )?;
        if self.config.check_numerics {
            check_numerics(&estimates.returns, "returns")?;
            check_numerics(&estimates.normalized_advantages, "normalized_advantages")?;
        }

        let old_params: Vec<_> = transitions.policy_step.info.iter().map(|p| p.detach()).collect();
        let old_distribution = ActionDistribution::from_params(&old_params, &self.action_spec)?;
        let actions = &transitions.policy_step.action;
        let old_log_probs = old_distribution.log_probability(actions, &outer_shape)?.detach();
        let mask = mask.to_device(old_log_probs.device());

        let beta = self.adaptive_kl_beta();
        let actor = &self.actor;
        let value_network = &self.value_network;
        let action_spec = &self.action_spec;
        let loss_assembler = &self.loss_assembler;
        let optimizer = &mut self.optimizer;
        let step_types = &transitions.time_step.step_type;

        let summary = self.scheduler.run(|_epoch| {
            let current = evaluate_policy(actor, action_spec, &step_observations)?;
            let log_probs = current.log_probability(actions, &outer_shape)?;
            let entropy = current.entropy(&outer_shape)?;
            let kl = old_distribution.kl_divergence(&current, &outer_shape)?;
            let values =
                evaluate_values(value_network, &step_observations, step_types, outer_shape)?;

            let policy_weights = actor.regularizable_weights();
            let value_weights = value_network.regularizable_weights();
            let terms = loss_assembler.compute(
                &LossInputs {
                    log_probs: &log_probs,
                    old_log_probs: &old_log_probs,
                    advantages: &estimates.normalized_advantages,
                    returns: &estimates.returns,
                    value_preds: &values,
                    entropy: &entropy,
                    kl: &kl,
                    mask: Some(&mask),
                    policy_weights: &policy_weights,
                    value_weights: &value_weights,
                },
                beta,
            )?;

            optimizer.apply(&terms.total_loss)?;
            LossInfo::from_terms(&terms)
        })?;

        // KL between the collection policy and the fully updated policy
        let mean_kl = tch::no_grad(|| -> Result<f64> {
            let updated = evaluate_policy(&self.actor, &self.action_spec, &step_observations)?;
            let kl = old_distribution.kl_divergence(&updated, &outer_shape)?;
            Ok(f64::try_from(&masked_mean(&kl, Some(&mask)))?)
        })?;
        let adaptive_kl_beta = self.kl_controller.as_mut().map(|kl| kl.update(mean_kl));

        // Deferred normalizer updates from raw values; the bootstrap step of
        // each row is left for the call that trains on it
        if let Some(normalizer) = self.observation_normalizer.as_mut() {
            normalizer.update(&transitions.time_step.observation, &BATCH_TIME_DIMS)?;
        }
        if let Some(normalizer) = self.reward_normalizer.as_mut() {
            normalizer.update(&transitions.next_time_step.reward, &BATCH_TIME_DIMS)?;
        }

        self.train_step += 1;
        let per_epoch = summary.total.average();
        info!(
            train_step = self.train_step,
            epochs = summary.total.num_epochs,
            total_loss = summary.total.total_loss,
            mean_policy_gradient_loss = per_epoch.policy_gradient_loss,
            mean_value_estimation_loss = per_epoch.value_estimation_loss,
            mean_kl_penalty_loss = per_epoch.kl_penalty_loss,
            mean_clip_fraction = per_epoch.clip_fraction,
            mean_kl,
            "PPO train step complete"
        );

        Ok(TrainStepOutput {
            loss: summary.total,
            last_epoch: summary.last,
            mean_kl,
            adaptive_kl_beta,
            train_step: self.train_step,
        })
    }
}

fn transitions_shape(transitions: &Transition) -> (i64, i64) {
    let outer = transitions.time_step.outer_shape();
    (outer[0], outer[1])
}

/// Evaluate the actor and rebuild its action distribution
fn evaluate_policy<A: ActorNetwork>(
    actor: &A,
    action_spec: &ActionSpec,
    observations: &Tensor,
) -> Result<ActionDistribution> {
    let state = actor.initial_state(observations.size()[0]);
    let (params, _) = actor.evaluate(observations, state.as_ref())?;
    ActionDistribution::from_params(&params, action_spec)
}

/// Evaluate the value network and check its output is `[batch, time]`
fn evaluate_values<V: ValueNetwork>(
    value_network: &V,
    observations: &Tensor,
    step_types: &Tensor,
    expected: [i64; 2],
) -> Result<Tensor> {
    let state = value_network.initial_state(expected[0]);
    let (values, _) = value_network.evaluate(observations, step_types, state.as_ref())?;
    if values.size() != expected {
        return Err(PpoError::validation(format!(
            "value network returned shape {:?}, expected {:?}",
            values.size(),
            expected
        )));
    }
    Ok(values.to_kind(Kind::Float))
}
