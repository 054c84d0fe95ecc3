//! PPO configuration and hyperparameters
//!
//! This module defines the configuration parameters for a PPO training
//! call and provides validation, builder pattern methods and JSON
//! load/save helpers.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{PpoError, Result};

/// PPO configuration parameters
///
/// These hyperparameters control return estimation, the five loss terms,
/// the adaptive KL controller and the normalizers. Default values follow
/// the usual PPO settings for continuous-control tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PPOConfig {
    /// Clipped-surrogate epsilon, 0 disables clipping
    pub importance_ratio_clipping: f64,

    /// GAE lambda parameter
    pub lambda_value: f64,

    /// Discount factor (gamma) multiplied into environment discounts
    pub discount_factor: f64,

    /// Entropy regularization coefficient
    pub entropy_regularization: f64,

    /// L2 coefficient for the actor's kernel weights
    pub policy_l2_reg: f64,

    /// L2 coefficient for the value network's kernel weights
    pub value_function_l2_reg: f64,

    /// Value loss coefficient
    pub value_pred_loss_coef: f64,

    /// Number of optimization passes per training call
    pub num_epochs: usize,

    /// Use GAE instead of empirical advantages
    pub use_gae: bool,

    /// Use TD(λ) returns as value targets (needs `use_gae`)
    pub use_td_lambda_return: bool,

    /// Normalize rewards with a streaming normalizer
    pub normalize_rewards: bool,

    /// Symmetric clip for normalized rewards, 0 disables
    pub reward_norm_clipping: f64,

    /// Normalize observations with a streaming normalizer
    pub normalize_observations: bool,

    /// Symmetric clip for normalized observations, 0 disables
    pub observation_norm_clipping: f64,

    /// Bound on the log importance ratio, 0 disables
    pub log_prob_clipping: f64,

    /// KL cutoff = factor * target, 0 disables the cutoff term
    pub kl_cutoff_factor: f64,

    /// Coefficient of the squared KL cutoff penalty
    pub kl_cutoff_coef: f64,

    /// Initial adaptive KL beta, values <= 0 disable the controller
    pub initial_adaptive_kl_beta: f64,

    /// Target mean KL divergence
    pub adaptive_kl_target: f64,

    /// Relative tolerance band around the KL target
    pub adaptive_kl_tolerance: f64,

    /// Maximum global gradient norm, `None` disables clipping
    pub gradient_clipping: Option<f64>,

    /// Keep unfinished tail episodes valid in the mask
    pub allow_partial_episodes: bool,

    /// Fail the call on NaN/Inf in intermediate tensors
    pub check_numerics: bool,

    /// Log per-epoch loss diagnostics
    pub debug_summaries: bool,
}

impl Default for PPOConfig {
    fn default() -> Self {
        Self {
            importance_ratio_clipping: 0.2,
            lambda_value: 0.95,
            discount_factor: 0.99,
            entropy_regularization: 0.0,
            policy_l2_reg: 0.0,
            value_function_l2_reg: 0.0,
            value_pred_loss_coef: 0.5,
            num_epochs: 25,
            use_gae: false,
            use_td_lambda_return: false,
            normalize_rewards: true,
            reward_norm_clipping: 10.0,
            normalize_observations: true,
            observation_norm_clipping: 5.0,
            log_prob_clipping: 0.0,
            kl_cutoff_factor: 2.0,
            kl_cutoff_coef: 1000.0,
            initial_adaptive_kl_beta: 1.0,
            adaptive_kl_target: 0.01,
            adaptive_kl_tolerance: 0.3,
            gradient_clipping: None,
            allow_partial_episodes: false,
            check_numerics: false,
            debug_summaries: false,
        }
    }
}

impl PPOConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("importance_ratio_clipping", self.importance_ratio_clipping),
            ("entropy_regularization", self.entropy_regularization),
            ("policy_l2_reg", self.policy_l2_reg),
            ("value_function_l2_reg", self.value_function_l2_reg),
            ("value_pred_loss_coef", self.value_pred_loss_coef),
            ("reward_norm_clipping", self.reward_norm_clipping),
            ("observation_norm_clipping", self.observation_norm_clipping),
            ("log_prob_clipping", self.log_prob_clipping),
            ("kl_cutoff_factor", self.kl_cutoff_factor),
            ("kl_cutoff_coef", self.kl_cutoff_coef),
        ];
        for (name, value) in non_negative {
            if value.is_nan() || value < 0.0 {
                return Err(PpoError::configuration(format!(
                    "{} must be non-negative, got {}",
                    name, value
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.discount_factor) {
            return Err(PpoError::configuration("discount_factor must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.lambda_value) {
            return Err(PpoError::configuration("lambda_value must be in [0, 1]"));
        }
        if self.num_epochs == 0 {
            return Err(PpoError::configuration("num_epochs must be positive"));
        }
        if self.adaptive_kl_target.is_nan() || self.adaptive_kl_target <= 0.0 {
            return Err(PpoError::configuration("adaptive_kl_target must be positive"));
        }
        if !(0.0..1.0).contains(&self.adaptive_kl_tolerance) {
            return Err(PpoError::configuration("adaptive_kl_tolerance must be in [0, 1)"));
        }
        if let Some(max_norm) = self.gradient_clipping {
            if max_norm.is_nan() || max_norm <= 0.0 {
                return Err(PpoError::configuration("gradient_clipping must be positive"));
            }
        }
        Ok(())
    }

    /// Whether TD(λ) value targets will actually be used
    pub fn uses_td_lambda_return(&self) -> bool {
        self.use_td_lambda_return && self.use_gae
    }

    /// Parse a configuration from a JSON string and validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a JSON file
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Save the configuration as pretty-printed JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Set clipped-surrogate epsilon
    pub fn importance_ratio_clipping(mut self, epsilon: f64) -> Self {
        self.importance_ratio_clipping = epsilon;
        self
    }

    /// Set GAE lambda
    pub fn lambda_value(mut self, lambda: f64) -> Self {
        self.lambda_value = lambda;
        self
    }

    /// Set discount factor
    pub fn discount_factor(mut self, gamma: f64) -> Self {
        self.discount_factor = gamma;
        self
    }

    /// Set entropy regularization coefficient
    pub fn entropy_regularization(mut self, coef: f64) -> Self {
        self.entropy_regularization = coef;
        self
    }

    /// Set actor L2 coefficient
    pub fn policy_l2_reg(mut self, coef: f64) -> Self {
        self.policy_l2_reg = coef;
        self
    }

    /// Set value network L2 coefficient
    pub fn value_function_l2_reg(mut self, coef: f64) -> Self {
        self.value_function_l2_reg = coef;
        self
    }

    /// Set value loss coefficient
    pub fn value_pred_loss_coef(mut self, coef: f64) -> Self {
        self.value_pred_loss_coef = coef;
        self
    }

    /// Set number of epochs per training call
    pub fn num_epochs(mut self, epochs: usize) -> Self {
        self.num_epochs = epochs;
        self
    }

    /// Enable or disable GAE
    pub fn use_gae(mut self, enabled: bool) -> Self {
        self.use_gae = enabled;
        self
    }

    /// Enable or disable TD(λ) return targets
    pub fn use_td_lambda_return(mut self, enabled: bool) -> Self {
        self.use_td_lambda_return = enabled;
        self
    }

    /// Enable or disable reward normalization
    pub fn normalize_rewards(mut self, enabled: bool) -> Self {
        self.normalize_rewards = enabled;
        self
    }

    /// Set normalized-reward clip
    pub fn reward_norm_clipping(mut self, clip: f64) -> Self {
        self.reward_norm_clipping = clip;
        self
    }

    /// Enable or disable observation normalization
    pub fn normalize_observations(mut self, enabled: bool) -> Self {
        self.normalize_observations = enabled;
        self
    }

    /// Set normalized-observation clip
    pub fn observation_norm_clipping(mut self, clip: f64) -> Self {
        self.observation_norm_clipping = clip;
        self
    }

    /// Set log importance-ratio bound
    pub fn log_prob_clipping(mut self, clip: f64) -> Self {
        self.log_prob_clipping = clip;
        self
    }

    /// Set KL cutoff factor
    pub fn kl_cutoff_factor(mut self, factor: f64) -> Self {
        self.kl_cutoff_factor = factor;
        self
    }

    /// Set KL cutoff coefficient
    pub fn kl_cutoff_coef(mut self, coef: f64) -> Self {
        self.kl_cutoff_coef = coef;
        self
    }

    /// Set initial adaptive KL beta
    pub fn initial_adaptive_kl_beta(mut self, beta: f64) -> Self {
        self.initial_adaptive_kl_beta = beta;
        self
    }

    /// Set target mean KL
    pub fn adaptive_kl_target(mut self, target: f64) -> Self {
        self.adaptive_kl_target = target;
        self
    }

    /// Set KL tolerance band
    pub fn adaptive_kl_tolerance(mut self, tolerance: f64) -> Self {
        self.adaptive_kl_tolerance = tolerance;
        self
    }

    /// Set maximum gradient norm
    pub fn gradient_clipping(mut self, max_norm: Option<f64>) -> Self {
        self.gradient_clipping = max_norm;
        self
    }

    /// Keep unfinished tail episodes in the loss
    pub fn allow_partial_episodes(mut self, enabled: bool) -> Self {
        self.allow_partial_episodes = enabled;
        self
    }

    /// Enable NaN/Inf checks
    pub fn check_numerics(mut self, enabled: bool) -> Self {
        self.check_numerics = enabled;
        self
    }

    /// Enable per-epoch debug logging
    pub fn debug_summaries(mut self, enabled: bool) -> Self {
        self.debug_summaries = enabled;
        self
    }
}
