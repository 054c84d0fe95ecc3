//! Loss computation functions for PPO
//!
//! This module contains the five additive loss terms of a PPO epoch:
//! the clipped-surrogate policy loss, the value loss, L2 and entropy
//! regularization and the KL penalty. [`LossAssembler`] combines them
//! for one epoch's view of the batch.
//!
//! Every masked mean divides by the total number of `[batch, time]`
//! elements, so masked positions contribute exactly zero.

use tch::{Kind, Tensor};

use super::config::PPOConfig;
use crate::{error::Result, utils::numerics::check_numerics};

/// Mean of `x * mask` over every element, or the plain mean without a mask
pub fn masked_mean(x: &Tensor, mask: Option<&Tensor>) -> Tensor {
    match mask {
        Some(mask) => (x * mask).mean(Kind::Float),
        None => x.mean(Kind::Float),
    }
}

fn scalar_zero(like: &Tensor) -> Tensor {
    Tensor::from(0f32).to_device(like.device())
}

/// Clipped-surrogate loss and its diagnostics
#[derive(Debug)]
pub struct PolicyGradientLoss {
    /// `-mean(objective * mask)`
    pub loss: Tensor,

    /// Per-step importance ratio `[batch, time]`
    pub importance_ratio: Tensor,

    /// Masked fraction of steps whose ratio left `[1 - ε, 1 + ε]`
    pub clip_fraction: Tensor,

    /// Masked mean importance ratio
    pub importance_ratio_mean: Tensor,
}

/// Compute the PPO clipped-surrogate policy loss
///
/// # Arguments
/// * `log_probs` - Log probabilities of the taken actions under the current policy
/// * `old_log_probs` - Log probabilities under the collection policy
/// * `advantages` - Normalized advantages
/// * `mask` - Validity mask, `None` keeps every step
/// * `importance_ratio_clipping` - Epsilon, 0 uses the unclipped objective
/// * `log_prob_clipping` - Bound on the log ratio, 0 disables
pub fn policy_gradient_loss(
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    advantages: &Tensor,
    mask: Option<&Tensor>,
    importance_ratio_clipping: f64,
    log_prob_clipping: f64,
) -> PolicyGradientLoss {
    let mut log_ratio = log_probs - old_log_probs;
    if log_prob_clipping > 0.0 {
        log_ratio = log_ratio.clamp(-log_prob_clipping, log_prob_clipping);
    }
    let ratio = log_ratio.exp();

    let (objective, clip_fraction) = if importance_ratio_clipping > 0.0 {
        let clipped_ratio =
            ratio.clamp(1.0 - importance_ratio_clipping, 1.0 + importance_ratio_clipping);
        let unclipped = &ratio * advantages;
        let clipped = clipped_ratio * advantages;

        let was_clipped = (&ratio - 1.0).abs().gt(importance_ratio_clipping).to_kind(Kind::Float);
        (unclipped.minimum(&clipped), masked_mean(&was_clipped, mask).detach())
    } else {
        (&ratio * advantages, scalar_zero(log_probs))
    };

    PolicyGradientLoss {
        loss: -masked_mean(&objective, mask),
        importance_ratio_mean: masked_mean(&ratio, mask).detach(),
        importance_ratio: ratio,
        clip_fraction,
    }
}

/// Compute the masked mean-squared value loss, scaled by `coef`
///
/// # Arguments
/// * `value_preds` - Current value estimates `[batch, time]`
/// * `returns` - Value targets `[batch, time]`
/// * `mask` - Validity mask, `None` keeps every step
/// * `coef` - Value loss coefficient
pub fn value_estimation_loss(
    value_preds: &Tensor,
    returns: &Tensor,
    mask: Option<&Tensor>,
    coef: f64,
) -> Tensor {
    let squared_error = (returns - value_preds).square();
    masked_mean(&squared_error, mask) * coef
}

/// Compute `policy_coef * Σ‖w‖² + value_coef * Σ‖w‖²` over kernel weights
pub fn l2_regularization_loss(
    policy_weights: &[Tensor],
    policy_coef: f64,
    value_weights: &[Tensor],
    value_coef: f64,
) -> Tensor {
    let weighted_sum = |weights: &[Tensor], coef: f64| -> Option<Tensor> {
        if coef == 0.0 || weights.is_empty() {
            return None;
        }
        weights
            .iter()
            .map(|w| w.square().sum(Kind::Float))
            .reduce(|acc, x| acc + x)
            .map(|sum| sum * coef)
    };

    let terms: Vec<Tensor> = [
        weighted_sum(policy_weights, policy_coef),
        weighted_sum(value_weights, value_coef),
    ]
    .into_iter()
    .flatten()
    .collect();

    match terms.into_iter().reduce(|acc, x| acc + x) {
        Some(total) => total,
        None => Tensor::from(0f32),
    }
}

/// Compute `mean(-entropy * mask) * coef`
pub fn entropy_regularization_loss(entropy: &Tensor, mask: Option<&Tensor>, coef: f64) -> Tensor {
    if coef == 0.0 {
        return scalar_zero(entropy);
    }
    masked_mean(&entropy.neg(), mask) * coef
}

/// Squared penalty on mean KL beyond `cutoff_factor * target`
///
/// `coef * max(mean(kl * mask) - cutoff_factor * target, 0)^2`. Zero when
/// either the factor or the coefficient is 0.
pub fn kl_cutoff_loss(
    kl: &Tensor,
    mask: Option<&Tensor>,
    cutoff_factor: f64,
    target: f64,
    coef: f64,
) -> Tensor {
    if cutoff_factor <= 0.0 || coef == 0.0 {
        return scalar_zero(kl);
    }
    let mean_kl = masked_mean(kl, mask);
    (mean_kl - cutoff_factor * target).relu().square() * coef
}

/// Linear KL penalty `beta * mean(kl * mask)`, zero without a controller
pub fn adaptive_kl_loss(kl: &Tensor, mask: Option<&Tensor>, beta: Option<f64>) -> Tensor {
    match beta {
        Some(beta) => masked_mean(kl, mask) * beta,
        None => scalar_zero(kl),
    }
}

/// Per-step quantities one epoch's losses are computed from
///
/// All tensors are `[batch, time]` and share the same validity mask.
#[derive(Debug)]
pub struct LossInputs<'a> {
    /// Log probabilities of the taken actions under the current weights
    pub log_probs: &'a Tensor,

    /// Log probabilities recorded at collection time
    pub old_log_probs: &'a Tensor,

    /// Normalized advantages
    pub advantages: &'a Tensor,

    /// Value targets
    pub returns: &'a Tensor,

    /// Current value estimates
    pub value_preds: &'a Tensor,

    /// Current policy entropy
    pub entropy: &'a Tensor,

    /// KL divergence from the collection policy to the current policy
    pub kl: &'a Tensor,

    /// Validity mask
    pub mask: Option<&'a Tensor>,

    /// Actor kernel weights
    pub policy_weights: &'a [Tensor],

    /// Value network kernel weights
    pub value_weights: &'a [Tensor],
}

/// The five loss terms of one epoch plus diagnostics
///
/// `total_loss` is the plain sum of the five terms and keeps the autograd
/// graph. Diagnostics are detached.
#[derive(Debug)]
pub struct LossTerms {
    /// Sum of the five terms below
    pub total_loss: Tensor,

    /// Clipped-surrogate loss
    pub policy_gradient_loss: Tensor,

    /// Scaled value loss
    pub value_estimation_loss: Tensor,

    /// L2 regularization of kernel weights
    pub l2_regularization_loss: Tensor,

    /// Entropy regularization
    pub entropy_regularization_loss: Tensor,

    /// KL cutoff plus adaptive KL penalty
    pub kl_penalty_loss: Tensor,

    /// Fraction of clipped importance ratios
    pub clip_fraction: Tensor,

    /// Mean importance ratio
    pub importance_ratio_mean: Tensor,

    /// Mean policy entropy
    pub entropy_mean: Tensor,

    /// Mean KL divergence
    pub kl_mean: Tensor,
}

/// Builds the five PPO loss terms with fixed coefficients
#[derive(Debug, Clone)]
pub struct LossAssembler {
    importance_ratio_clipping: f64,
    log_prob_clipping: f64,
    value_pred_loss_coef: f64,
    policy_l2_reg: f64,
    value_function_l2_reg: f64,
    entropy_regularization: f64,
    kl_cutoff_factor: f64,
    kl_cutoff_coef: f64,
    adaptive_kl_target: f64,
    check_numerics: bool,
}

impl LossAssembler {
    /// Take coefficients from a training configuration
    pub fn from_config(config: &PPOConfig) -> Self {
        Self {
            importance_ratio_clipping: config.importance_ratio_clipping,
            log_prob_clipping: config.log_prob_clipping,
            value_pred_loss_coef: config.value_pred_loss_coef,
            policy_l2_reg: config.policy_l2_reg,
            value_function_l2_reg: config.value_function_l2_reg,
            entropy_regularization: config.entropy_regularization,
            kl_cutoff_factor: config.kl_cutoff_factor,
            kl_cutoff_coef: config.kl_cutoff_coef,
            adaptive_kl_target: config.adaptive_kl_target,
            check_numerics: config.check_numerics,
        }
    }

    /// Compute every loss term for one epoch
    ///
    /// # Arguments
    /// * `inputs` - This epoch's per-step tensors
    /// * `adaptive_kl_beta` - Current β, `None` when the controller is disabled
    pub fn compute(&self, inputs: &LossInputs, adaptive_kl_beta: Option<f64>) -> Result<LossTerms> {
        let mask = inputs.mask;

        self.check("log_probs", inputs.log_probs)?;
        let pg = policy_gradient_loss(
            inputs.log_probs,
            inputs.old_log_probs,
            inputs.advantages,
            mask,
            self.importance_ratio_clipping,
            self.log_prob_clipping,
        );
        self.check("importance_ratio", &pg.importance_ratio)?;
        self.check("policy_gradient_loss", &pg.loss)?;

        let value_loss = value_estimation_loss(
            inputs.value_preds,
            inputs.returns,
            mask,
            self.value_pred_loss_coef,
        );
        self.check("value_estimation_loss", &value_loss)?;

        let l2_loss = l2_regularization_loss(
            inputs.policy_weights,
            self.policy_l2_reg,
            inputs.value_weights,
            self.value_function_l2_reg,
        )
        .to_device(inputs.log_probs.device());
        self.check("l2_regularization_loss", &l2_loss)?;

        let entropy_loss =
            entropy_regularization_loss(inputs.entropy, mask, self.entropy_regularization);
        self.check("entropy_regularization_loss", &entropy_loss)?;

        let kl_loss = kl_cutoff_loss(
            inputs.kl,
            mask,
            self.kl_cutoff_factor,
            self.adaptive_kl_target,
            self.kl_cutoff_coef,
        ) + adaptive_kl_loss(inputs.kl, mask, adaptive_kl_beta);
        self.check("kl_penalty_loss", &kl_loss)?;

        let total_loss = &pg.loss + &value_loss + &l2_loss + &entropy_loss + &kl_loss;

        Ok(LossTerms {
            total_loss,
            policy_gradient_loss: pg.loss,
            value_estimation_loss: value_loss,
            l2_regularization_loss: l2_loss,
            entropy_regularization_loss: entropy_loss,
            kl_penalty_loss: kl_loss,
            clip_fraction: pg.clip_fraction,
            importance_ratio_mean: pg.importance_ratio_mean,
            entropy_mean: masked_mean(inputs.entropy, mask).detach(),
            kl_mean: masked_mean(inputs.kl, mask).detach(),
        })
    }

    fn check(&self, name: &str, tensor: &Tensor) -> Result<()> {
        if self.check_numerics {
            check_numerics(tensor, name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tch::Device;

    use super::*;
    use crate::error::PpoError;

    fn scalar(t: &Tensor) -> f64 {
        f64::try_from(t).unwrap()
    }

    fn row(values: &[f32]) -> Tensor {
        Tensor::from_slice(values).view([1, values.len() as i64])
    }

    #[test]
    fn test_clipped_objective_boundary() {
        // ratio = 1.3 clips to 1.2, ratio = 0.5 stays at 0.5
        let log_probs = row(&[1.3f32.ln(), 0.5f32.ln()]);
        let old_log_probs = row(&[0.0, 0.0]);
        let advantages = row(&[1.0, 1.0]);

        let pg = policy_gradient_loss(&log_probs, &old_log_probs, &advantages, None, 0.2, 0.0);
        assert!((scalar(&pg.loss) + (1.2 + 0.5) / 2.0).abs() < 1e-5);
        assert!((scalar(&pg.clip_fraction) - 1.0).abs() < 1e-6);
        assert!((scalar(&pg.importance_ratio_mean) - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_zero_epsilon_uses_unclipped_objective() {
        let log_probs = row(&[1.3f32.ln(), 0.5f32.ln()]);
        let old_log_probs = row(&[0.0, 0.0]);
        let advantages = row(&[1.0, 1.0]);

        let pg = policy_gradient_loss(&log_probs, &old_log_probs, &advantages, None, 0.0, 0.0);
        assert!((scalar(&pg.loss) + 0.9).abs() < 1e-5);
        assert_eq!(scalar(&pg.clip_fraction), 0.0);
    }

    #[test]
    fn test_log_prob_clipping_bounds_ratio() {
        let log_probs = row(&[1.0, -1.0]);
        let old_log_probs = row(&[0.0, 0.0]);

        let pg =
            policy_gradient_loss(&log_probs, &old_log_probs, &row(&[1.0, 1.0]), None, 0.0, 0.1);
        let ratios = Vec::<f32>::try_from(pg.importance_ratio.reshape([-1])).unwrap();
        assert!((ratios[0] - 0.1f32.exp()).abs() < 1e-5);
        assert!((ratios[1] - (-0.1f32).exp()).abs() < 1e-5);
    }

    #[test]
    fn test_clipped_objective_never_exceeds_unclipped() {
        tch::manual_seed(3);
        let opts = (Kind::Float, Device::Cpu);
        let log_probs = Tensor::randn([4, 16], opts) * 0.5;
        let old_log_probs = Tensor::zeros([4, 16], opts);
        let advantages = Tensor::rand([4, 16], opts) + 0.1;

        let ratios = log_probs.exp();
        let clipped =
            policy_gradient_loss(&log_probs, &old_log_probs, &advantages, None, 0.2, 0.0);
        let unclipped = -(&ratios * &advantages).mean(Kind::Float);
        assert!(scalar(&clipped.loss) >= scalar(&unclipped) - 1e-6);
    }

    /// Inputs from `[log_probs, old_log_probs, advantages, returns, values, entropy, kl]`
    fn epoch_inputs<'a>(tensors: &'a [Tensor; 7], mask: Option<&'a Tensor>) -> LossInputs<'a> {
        LossInputs {
            log_probs: &tensors[0],
            old_log_probs: &tensors[1],
            advantages: &tensors[2],
            returns: &tensors[3],
            value_preds: &tensors[4],
            entropy: &tensors[5],
            kl: &tensors[6],
            mask,
            policy_weights: &[],
            value_weights: &[],
        }
    }

    #[test]
    fn test_masking_idempotence() {
        tch::manual_seed(11);
        let opts = (Kind::Float, Device::Cpu);
        let log_probs = Tensor::randn([2, 5], opts) * 0.3;
        let old_log_probs = Tensor::randn([2, 5], opts) * 0.3;
        let advantages = Tensor::randn([2, 5], opts);
        let values = Tensor::randn([2, 5], opts);
        let returns = Tensor::randn([2, 5], opts);
        let entropy = Tensor::rand([2, 5], opts);
        let kl = Tensor::rand([2, 5], opts);
        let ones = Tensor::ones([2, 5], opts);
        let zeros = Tensor::zeros([2, 5], opts);

        let assembler = LossAssembler::from_config(
            &PPOConfig::new().entropy_regularization(0.01).kl_cutoff_factor(0.5),
        );
        let tensors = [log_probs, old_log_probs, advantages, returns, values, entropy, kl];

        let unmasked = assembler.compute(&epoch_inputs(&tensors, None), Some(1.0)).unwrap();
        let all_ones = assembler.compute(&epoch_inputs(&tensors, Some(&ones)), Some(1.0)).unwrap();
        let all_zeros =
            assembler.compute(&epoch_inputs(&tensors, Some(&zeros)), Some(1.0)).unwrap();

        for (a, b) in [
            (&unmasked.policy_gradient_loss, &all_ones.policy_gradient_loss),
            (&unmasked.value_estimation_loss, &all_ones.value_estimation_loss),
            (&unmasked.entropy_regularization_loss, &all_ones.entropy_regularization_loss),
            (&unmasked.kl_penalty_loss, &all_ones.kl_penalty_loss),
            (&unmasked.total_loss, &all_ones.total_loss),
        ] {
            assert!((scalar(a) - scalar(b)).abs() < 1e-6);
        }

        assert_eq!(scalar(&all_zeros.policy_gradient_loss), 0.0);
        assert_eq!(scalar(&all_zeros.value_estimation_loss), 0.0);
        assert_eq!(scalar(&all_zeros.entropy_regularization_loss), 0.0);
        assert_eq!(scalar(&all_zeros.kl_penalty_loss), 0.0);
    }

    #[test]
    fn test_value_estimation_loss() {
        let loss = value_estimation_loss(&row(&[0.0, 0.0]), &row(&[1.0, 2.0]), None, 0.5);
        assert!((scalar(&loss) - 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_l2_regularization_loss() {
        let policy = [Tensor::from_slice(&[1.0f32, 2.0]).view([1, 2])];
        let value = [Tensor::from_slice(&[3.0f32]).view([1, 1])];

        let loss = l2_regularization_loss(&policy, 0.1, &value, 0.0);
        assert!((scalar(&loss) - 0.5).abs() < 1e-6);

        let loss = l2_regularization_loss(&policy, 0.1, &value, 1.0);
        assert!((scalar(&loss) - 9.5).abs() < 1e-5);

        let loss = l2_regularization_loss(&policy, 0.0, &value, 0.0);
        assert_eq!(scalar(&loss), 0.0);
    }

    #[test]
    fn test_entropy_regularization_loss() {
        let entropy = row(&[1.0, 3.0]);
        let loss = entropy_regularization_loss(&entropy, None, 0.1);
        assert!((scalar(&loss) + 0.2).abs() < 1e-6);
        assert_eq!(scalar(&entropy_regularization_loss(&entropy, None, 0.0)), 0.0);
    }

    #[test]
    fn test_kl_cutoff_loss() {
        // mean KL 0.05 against cutoff 2 * 0.01: 1000 * 0.03^2
        let kl = row(&[0.04, 0.06]);
        let loss = kl_cutoff_loss(&kl, None, 2.0, 0.01, 1000.0);
        assert!((scalar(&loss) - 0.9).abs() < 1e-4);

        let below = row(&[0.01, 0.01]);
        assert_eq!(scalar(&kl_cutoff_loss(&below, None, 2.0, 0.01, 1000.0)), 0.0);
        assert_eq!(scalar(&kl_cutoff_loss(&kl, None, 0.0, 0.01, 1000.0)), 0.0);
        assert_eq!(scalar(&kl_cutoff_loss(&kl, None, 2.0, 0.01, 0.0)), 0.0);
    }

    #[test]
    fn test_adaptive_kl_loss() {
        let kl = row(&[0.01, 0.03]);
        assert!((scalar(&adaptive_kl_loss(&kl, None, Some(1.5))) - 0.03).abs() < 1e-6);
        assert_eq!(scalar(&adaptive_kl_loss(&kl, None, None)), 0.0);
    }

    #[test]
    fn test_total_is_sum_of_terms() {
        let opts = (Kind::Float, Device::Cpu);
        let log_probs = row(&[-0.5, -1.0, -0.2]);
        let old_log_probs = row(&[-0.6, -0.9, -0.2]);
        let advantages = row(&[1.0, -1.0, 0.5]);
        let values = row(&[0.1, 0.2, 0.3]);
        let returns = row(&[1.0, 0.0, 0.5]);
        let entropy = row(&[0.7, 0.7, 0.7]);
        let kl = row(&[0.02, 0.01, 0.0]);
        let weights = [Tensor::ones([2, 2], opts)];

        let assembler = LossAssembler::from_config(
            &PPOConfig::new().policy_l2_reg(0.01).entropy_regularization(0.1),
        );
        let terms = assembler
            .compute(
                &LossInputs {
                    log_probs: &log_probs,
                    old_log_probs: &old_log_probs,
                    advantages: &advantages,
                    returns: &returns,
                    value_preds: &values,
                    entropy: &entropy,
                    kl: &kl,
                    mask: None,
                    policy_weights: &weights,
                    value_weights: &[],
                },
                Some(1.0),
            )
            .unwrap();

        let sum = scalar(&terms.policy_gradient_loss)
            + scalar(&terms.value_estimation_loss)
            + scalar(&terms.l2_regularization_loss)
            + scalar(&terms.entropy_regularization_loss)
            + scalar(&terms.kl_penalty_loss);
        assert!((scalar(&terms.total_loss) - sum).abs() < 1e-6);
        assert!((scalar(&terms.l2_regularization_loss) - 0.04).abs() < 1e-6);
    }

    #[test]
    fn test_check_numerics_reports_nan() {
        let log_probs = row(&[f32::NAN, 0.0]);
        let zeros = row(&[0.0, 0.0]);
        let assembler = LossAssembler::from_config(&PPOConfig::new().check_numerics(true));

        let result = assembler.compute(
            &LossInputs {
                log_probs: &log_probs,
                old_log_probs: &zeros,
                advantages: &zeros,
                returns: &zeros,
                value_preds: &zeros,
                entropy: &zeros,
                kl: &zeros,
                mask: None,
                policy_weights: &[],
                value_weights: &[],
            },
            None,
        );
        match result {
            Err(PpoError::Numerical { name }) => assert_eq!(name, "log_probs"),
            other => panic!("expected numerical error, got {:?}", other.map(|_| ())),
        }
    }
}
