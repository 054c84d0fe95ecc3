//! Adaptive KL penalty coefficient
//!
//! β is rescaled once per training call from the mean KL divergence
//! between the collection policy and the fully updated policy:
//!
//! ```text
//! mean_kl < target * (1 - tolerance)  =>  β / 1.5
//! mean_kl > target * (1 + tolerance)  =>  β * 1.5
//! otherwise                           =>  β
//! ```
//!
//! The result is floored at [`BETA_FLOOR`].

use tracing::debug;

use super::config::PPOConfig;

/// Smallest value β can shrink to
pub const BETA_FLOOR: f64 = 1e-15;

/// Multiplicative step applied when the KL leaves the tolerance band
pub const BETA_STEP: f64 = 1.5;

/// Factor to multiply β by for an observed mean KL
///
/// The two bound checks are evaluated in a fixed order and cannot both hold
/// for a tolerance in `[0, 1)`.
pub fn beta_update_factor(mean_kl: f64, target: f64, tolerance: f64) -> f64 {
    if mean_kl < target * (1.0 - tolerance) {
        1.0 / BETA_STEP
    } else if mean_kl > target * (1.0 + tolerance) {
        BETA_STEP
    } else {
        1.0
    }
}

/// Owns the adaptive KL coefficient β
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveKlController {
    beta: f64,
    target: f64,
    tolerance: f64,
}

impl AdaptiveKlController {
    /// Create a controller
    ///
    /// Returns `None` when `initial_beta <= 0`, which disables the adaptive
    /// penalty entirely.
    pub fn new(initial_beta: f64, target: f64, tolerance: f64) -> Option<Self> {
        if initial_beta > 0.0 {
            Some(Self { beta: initial_beta, target, tolerance })
        } else {
            None
        }
    }

    /// Create a controller from a training configuration
    pub fn from_config(config: &PPOConfig) -> Option<Self> {
        Self::new(
            config.initial_adaptive_kl_beta,
            config.adaptive_kl_target,
            config.adaptive_kl_tolerance,
        )
    }

    /// Current β
    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Target mean KL
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Rescale β from the observed mean KL and return the new value
    pub fn update(&mut self, mean_kl: f64) -> f64 {
        let factor = beta_update_factor(mean_kl, self.target, self.tolerance);
        self.beta = (self.beta * factor).max(BETA_FLOOR);

        debug!(mean_kl, factor, beta = self.beta, "adaptive KL beta updated");
        self.beta
    }
}
