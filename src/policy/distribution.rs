//! Action distributions rebuilt from stored parameters
//!
//! The data-collection policy stores the parameters of the distribution it
//! sampled from, tagged with the distribution family. During training those
//! parameters are turned back into [`Distribution`]s so that log
//! probabilities, entropies and KL divergences can be computed against the
//! current policy.
//!
//! Two families are supported:
//! - [`DistributionKind::Normal`]: diagonal Gaussian with `loc` and `scale`,
//!   used for continuous actions
//! - [`DistributionKind::Categorical`]: softmax over `logits`, used for
//!   discrete actions
//!
//! Structured actions are handled by [`ActionDistribution`], which holds one
//! distribution per action component and sums their per-step quantities.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use crate::error::{PpoError, Result};

/// Class tag of a distribution family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionKind {
    /// Diagonal Gaussian (`loc`, `scale`)
    Normal,

    /// Categorical over the last dimension of `logits`
    Categorical,
}

impl DistributionKind {
    fn num_params(self) -> usize {
        match self {
            DistributionKind::Normal => 2,
            DistributionKind::Categorical => 1,
        }
    }
}

/// Stored distribution parameters: a class tag plus its parameter tensors
///
/// Parameter order is `[loc, scale]` for [`DistributionKind::Normal`] and
/// `[logits]` for [`DistributionKind::Categorical`].
#[derive(Debug)]
pub struct DistributionParams {
    /// Distribution family
    pub kind: DistributionKind,

    /// Parameter tensors, each `[batch, time, ...]`
    pub tensors: Vec<Tensor>,
}

impl DistributionParams {
    /// Parameters of a diagonal Gaussian
    pub fn normal(loc: Tensor, scale: Tensor) -> Self {
        Self { kind: DistributionKind::Normal, tensors: vec![loc, scale] }
    }

    /// Parameters of a categorical distribution
    pub fn categorical(logits: Tensor) -> Self {
        Self { kind: DistributionKind::Categorical, tensors: vec![logits] }
    }

    /// Apply `f` to every parameter tensor
    pub fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        Self { kind: self.kind, tensors: self.tensors.iter().map(f).collect() }
    }

    /// Copy of the parameters cut from the autograd graph
    pub fn detach(&self) -> Self {
        self.map(Tensor::detach)
    }
}

/// A single distribution from one of the supported families
#[derive(Debug)]
pub enum Distribution {
    /// Diagonal Gaussian
    Normal {
        /// Mean
        loc: Tensor,
        /// Standard deviation
        scale: Tensor,
    },

    /// Categorical over the last dimension
    Categorical {
        /// Unnormalized log probabilities
        logits: Tensor,
    },
}

impl Distribution {
    /// Rebuild a distribution from its class tag and parameters
    pub fn from_params(params: &DistributionParams) -> Result<Self> {
        let expected = params.kind.num_params();
        if params.tensors.len() != expected {
            return Err(PpoError::validation(format!(
                "{:?} distribution takes {} parameter tensors, got {}",
                params.kind,
                expected,
                params.tensors.len()
            )));
        }

        match params.kind {
            DistributionKind::Normal => {
                let (loc, scale) = (&params.tensors[0], &params.tensors[1]);
                if loc.size() != scale.size() {
                    return Err(PpoError::validation(format!(
                        "normal loc {:?} and scale {:?} shapes differ",
                        loc.size(),
                        scale.size()
                    )));
                }
                Ok(Distribution::Normal { loc: loc.shallow_clone(), scale: scale.shallow_clone() })
            }
            DistributionKind::Categorical => {
                let logits = &params.tensors[0];
                if logits.dim() == 0 {
                    return Err(PpoError::validation(
                        "categorical logits must have a class dimension",
                    ));
                }
                Ok(Distribution::Categorical { logits: logits.shallow_clone() })
            }
        }
    }

    /// Class tag of this distribution
    pub fn kind(&self) -> DistributionKind {
        match self {
            Distribution::Normal { .. } => DistributionKind::Normal,
            Distribution::Categorical { .. } => DistributionKind::Categorical,
        }
    }

    /// Log probability of `value`, reduced to `outer_shape`
    ///
    /// Categorical values are class indices; Normal values are real vectors
    /// whose event dimensions are summed.
    pub fn log_prob(&self, value: &Tensor, outer_shape: &[i64]) -> Result<Tensor> {
        let log_prob = match self {
            Distribution::Normal { loc, scale } => {
                let value = value.to_kind(loc.kind());
                let z = (&value - loc) / scale;
                -0.5 * z.square() - scale.log() - 0.5 * (2.0 * PI).ln()
            }
            Distribution::Categorical { logits } => {
                let index = value.to_kind(Kind::Int64).unsqueeze(-1);
                logits.log_softmax(-1, Kind::Float).gather(-1, &index, false).squeeze_dim(-1)
            }
        };
        reduce_to_outer(log_prob, outer_shape)
    }

    /// Analytic entropy, reduced to `outer_shape`
    pub fn entropy(&self, outer_shape: &[i64]) -> Result<Tensor> {
        let entropy = match self {
            Distribution::Normal { scale, .. } => 0.5 + 0.5 * (2.0 * PI).ln() + scale.log(),
            Distribution::Categorical { logits } => {
                let log_p = logits.log_softmax(-1, Kind::Float);
                -(log_p.exp() * &log_p).sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
            }
        };
        reduce_to_outer(entropy, outer_shape)
    }

    /// Analytic `KL(self || other)`, reduced to `outer_shape`
    ///
    /// Both distributions must belong to the same family.
    pub fn kl_divergence(&self, other: &Distribution, outer_shape: &[i64]) -> Result<Tensor> {
        let kl = match (self, other) {
            (
                Distribution::Normal { loc: loc_p, scale: scale_p },
                Distribution::Normal { loc: loc_q, scale: scale_q },
            ) => {
                let var_ratio = (scale_p / scale_q).square();
                let mean_term = ((loc_p - loc_q) / scale_q).square();
                0.5 * (&var_ratio + mean_term - 1.0 - var_ratio.log())
            }
            (
                Distribution::Categorical { logits: logits_p },
                Distribution::Categorical { logits: logits_q },
            ) => {
                let log_p = logits_p.log_softmax(-1, Kind::Float);
                let log_q = logits_q.log_softmax(-1, Kind::Float);
                (log_p.exp() * (&log_p - log_q)).sum_dim_intlist(
                    [-1i64].as_slice(),
                    false,
                    Kind::Float,
                )
            }
            (p, q) => {
                return Err(PpoError::validation(format!(
                    "cannot compute KL between {:?} and {:?}",
                    p.kind(),
                    q.kind()
                )));
            }
        };
        reduce_to_outer(kl, outer_shape)
    }

    /// Mean of a continuous distribution
    pub fn mean(&self) -> Option<Tensor> {
        match self {
            Distribution::Normal { loc, .. } => Some(loc.shallow_clone()),
            Distribution::Categorical { .. } => None,
        }
    }

    /// Standard deviation of a continuous distribution
    pub fn stddev(&self) -> Option<Tensor> {
        match self {
            Distribution::Normal { scale, .. } => Some(scale.shallow_clone()),
            Distribution::Categorical { .. } => None,
        }
    }
}

/// Spec of one action component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionComponentSpec {
    /// Integer action in `[0, num_actions)`
    Discrete {
        /// Number of choices
        num_actions: i64,
    },

    /// Real-valued action vector
    Continuous {
        /// Shape of one action
        shape: Vec<i64>,
    },
}

impl ActionComponentSpec {
    /// Whether the component is discrete
    pub fn is_discrete(&self) -> bool {
        matches!(self, ActionComponentSpec::Discrete { .. })
    }

    /// Family used to represent this component
    pub fn distribution_kind(&self) -> DistributionKind {
        if self.is_discrete() {
            DistributionKind::Categorical
        } else {
            DistributionKind::Normal
        }
    }
}

/// Spec of a (possibly structured) action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    components: Vec<ActionComponentSpec>,
}

impl ActionSpec {
    /// Structured action with the given components
    pub fn new(components: Vec<ActionComponentSpec>) -> Self {
        Self { components }
    }

    /// Single discrete action
    pub fn discrete(num_actions: i64) -> Self {
        Self::new(vec![ActionComponentSpec::Discrete { num_actions }])
    }

    /// Single continuous action
    pub fn continuous(shape: &[i64]) -> Self {
        Self::new(vec![ActionComponentSpec::Continuous { shape: shape.to_vec() }])
    }

    /// Action components in order
    pub fn components(&self) -> &[ActionComponentSpec] {
        &self.components
    }

    /// Whether every component is discrete
    pub fn is_discrete(&self) -> bool {
        self.components.iter().all(ActionComponentSpec::is_discrete)
    }

    /// Check that a policy's distribution families can serve this spec
    ///
    /// Every component needs a family with analytic log probability, entropy
    /// and KL divergence for its action type.
    pub fn check_distribution_kinds(&self, kinds: &[DistributionKind]) -> Result<()> {
        if self.components.is_empty() {
            return Err(PpoError::configuration("action spec has no components"));
        }
        if kinds.len() != self.components.len() {
            return Err(PpoError::configuration(format!(
                "action spec has {} components but the policy emits {} distributions",
                self.components.len(),
                kinds.len()
            )));
        }
        for (i, (component, &kind)) in self.components.iter().zip(kinds).enumerate() {
            if component.distribution_kind() != kind {
                return Err(PpoError::configuration(format!(
                    "action component {} ({:?}) has no analytic entropy/KL under a {:?} \
                     distribution",
                    i, component, kind
                )));
            }
        }
        Ok(())
    }
}

/// One distribution per action component
#[derive(Debug)]
pub struct ActionDistribution {
    components: Vec<Distribution>,
}

impl ActionDistribution {
    /// Rebuild the action distribution from stored parameters
    ///
    /// Fails with a validation error if the stored class tags do not match
    /// the action spec.
    pub fn from_params(params: &[DistributionParams], spec: &ActionSpec) -> Result<Self> {
        if params.len() != spec.components().len() {
            return Err(PpoError::validation(format!(
                "expected {} distribution parameter sets, got {}",
                spec.components().len(),
                params.len()
            )));
        }

        let components = params
            .iter()
            .zip(spec.components())
            .map(|(p, component)| {
                if p.kind != component.distribution_kind() {
                    return Err(PpoError::validation(format!(
                        "stored {:?} parameters for {:?} action component",
                        p.kind, component
                    )));
                }
                Distribution::from_params(p)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { components })
    }

    /// Per-component distributions
    pub fn components(&self) -> &[Distribution] {
        &self.components
    }

    /// Log probability of a structured action, summed over components
    pub fn log_probability(&self, actions: &[Tensor], outer_shape: &[i64]) -> Result<Tensor> {
        if actions.len() != self.components.len() {
            return Err(PpoError::validation(format!(
                "expected {} action components, got {}",
                self.components.len(),
                actions.len()
            )));
        }
        self.sum_components(|i, dist| dist.log_prob(&actions[i], outer_shape))
    }

    /// Entropy summed over components
    pub fn entropy(&self, outer_shape: &[i64]) -> Result<Tensor> {
        self.sum_components(|_, dist| dist.entropy(outer_shape))
    }

    /// `KL(self || other)` summed over components, shaped `outer_shape`
    pub fn kl_divergence(&self, other: &ActionDistribution, outer_shape: &[i64]) -> Result<Tensor> {
        if other.components.len() != self.components.len() {
            return Err(PpoError::validation(format!(
                "cannot compare distributions with {} and {} components",
                self.components.len(),
                other.components.len()
            )));
        }
        self.sum_components(|i, dist| dist.kl_divergence(&other.components[i], outer_shape))
    }

    fn sum_components(
        &self,
        mut f: impl FnMut(usize, &Distribution) -> Result<Tensor>,
    ) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for (i, dist) in self.components.iter().enumerate() {
            let value = f(i, dist)?;
            total = Some(match total {
                Some(acc) => acc + value,
                None => value,
            });
        }
        total.ok_or_else(|| PpoError::validation("action distribution has no components"))
    }
}

/// Sum every dimension past `outer_shape`, then broadcast to it
fn reduce_to_outer(tensor: Tensor, outer_shape: &[i64]) -> Result<Tensor> {
    let outer_rank = outer_shape.len() as i64;
    let rank = tensor.dim() as i64;

    let reduced = if rank > outer_rank {
        let event_dims: Vec<i64> = (outer_rank..rank).collect();
        tensor.sum_dim_intlist(event_dims.as_slice(), false, tensor.kind())
    } else {
        tensor
    };

    if reduced.size() == outer_shape {
        return Ok(reduced);
    }
    reduced.f_expand(outer_shape, false).map_err(|_| {
        PpoError::validation(format!(
            "cannot shape {:?} into outer shape {:?}",
            reduced.size(),
            outer_shape
        ))
    })
}

#[cfg(test)]
mod tests {
    use tch::Device;

    use super::*;

    const OPTS: (Kind, Device) = (Kind::Float, Device::Cpu);

    fn values(t: &Tensor) -> Vec<f32> {
        Vec::<f32>::try_from(t.reshape([-1])).unwrap()
    }

    #[test]
    fn test_categorical_log_prob_and_entropy() {
        let dist = Distribution::from_params(&DistributionParams::categorical(Tensor::zeros(
            [2, 3, 4],
            OPTS,
        )))
        .unwrap();
        let actions = Tensor::from_slice(&[0i64, 1, 2, 3, 0, 1]).view([2, 3]);

        let log_prob = dist.log_prob(&actions, &[2, 3]).unwrap();
        assert_eq!(log_prob.size(), vec![2, 3]);
        for v in values(&log_prob) {
            assert!((v - (-(4.0f32).ln())).abs() < 1e-5);
        }

        for v in values(&dist.entropy(&[2, 3]).unwrap()) {
            assert!((v - (4.0f32).ln()).abs() < 1e-5);
        }
        assert!(dist.mean().is_none());
    }

    #[test]
    fn test_normal_log_prob_sums_event_dims() {
        let params = DistributionParams::normal(
            Tensor::zeros([1, 2, 3], OPTS),
            Tensor::ones([1, 2, 3], OPTS),
        );
        let dist = Distribution::from_params(&params).unwrap();

        let log_prob = dist.log_prob(&Tensor::zeros([1, 2, 3], OPTS), &[1, 2]).unwrap();
        assert_eq!(log_prob.size(), vec![1, 2]);
        let expected = -3.0 * 0.5 * (2.0 * std::f32::consts::PI).ln();
        for v in values(&log_prob) {
            assert!((v - expected).abs() < 1e-4);
        }

        // 0.5 + 0.5 ln(2 pi) per dimension
        for v in values(&dist.entropy(&[1, 2]).unwrap()) {
            assert!((v - 3.0 * 1.418_938_5).abs() < 1e-4);
        }
    }

    #[test]
    fn test_normal_kl_matches_closed_form() {
        let p = Distribution::from_params(&DistributionParams::normal(
            Tensor::zeros([1, 1, 1], OPTS),
            Tensor::ones([1, 1, 1], OPTS),
        ))
        .unwrap();
        let q = Distribution::from_params(&DistributionParams::normal(
            Tensor::ones([1, 1, 1], OPTS),
            Tensor::full([1, 1, 1], 2.0, OPTS),
        ))
        .unwrap();

        // ln 2 + (1 + 1) / 8 - 1/2
        let kl = f64::try_from(p.kl_divergence(&q, &[1, 1]).unwrap().sum(Kind::Float)).unwrap();
        assert!((kl - (2.0f64.ln() + 0.25 - 0.5)).abs() < 1e-5);

        let self_kl =
            f64::try_from(p.kl_divergence(&p, &[1, 1]).unwrap().sum(Kind::Float)).unwrap();
        assert!(self_kl.abs() < 1e-6);
    }

    #[test]
    fn test_categorical_kl_is_non_negative() {
        let p = Distribution::from_params(&DistributionParams::categorical(Tensor::from_slice(&[
            1.0f32, 0.0, -1.0,
        ])
        .view([1, 1, 3])))
        .unwrap();
        let q = Distribution::from_params(&DistributionParams::categorical(Tensor::zeros(
            [1, 1, 3],
            OPTS,
        )))
        .unwrap();

        let kl = f64::try_from(p.kl_divergence(&q, &[1, 1]).unwrap().sum(Kind::Float)).unwrap();
        assert!(kl > 0.0);
    }

    #[test]
    fn test_kl_across_families_is_rejected() {
        let p = Distribution::from_params(&DistributionParams::categorical(Tensor::zeros(
            [1, 1, 2],
            OPTS,
        )))
        .unwrap();
        let q = Distribution::from_params(&DistributionParams::normal(
            Tensor::zeros([1, 1, 2], OPTS),
            Tensor::ones([1, 1, 2], OPTS),
        ))
        .unwrap();
        assert!(matches!(p.kl_divergence(&q, &[1, 1]), Err(PpoError::Validation(_))));
    }

    #[test]
    fn test_structured_action_sums_components() {
        let spec = ActionSpec::new(vec![
            ActionComponentSpec::Discrete { num_actions: 2 },
            ActionComponentSpec::Continuous { shape: vec![1] },
        ]);
        let params = vec![
            DistributionParams::categorical(Tensor::zeros([1, 2, 2], OPTS)),
            DistributionParams::normal(
                Tensor::zeros([1, 2, 1], OPTS),
                Tensor::ones([1, 2, 1], OPTS),
            ),
        ];
        let dist = ActionDistribution::from_params(&params, &spec).unwrap();

        let actions = vec![
            Tensor::zeros([1, 2], (Kind::Int64, Device::Cpu)),
            Tensor::zeros([1, 2, 1], OPTS),
        ];
        let log_prob = dist.log_probability(&actions, &[1, 2]).unwrap();

        let expected = -(2.0f32).ln() - 0.5 * (2.0 * std::f32::consts::PI).ln();
        for v in values(&log_prob) {
            assert!((v - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_mismatched_tags_are_rejected() {
        let spec = ActionSpec::discrete(3);
        let params = vec![DistributionParams::normal(
            Tensor::zeros([1, 1], OPTS),
            Tensor::ones([1, 1], OPTS),
        )];
        assert!(matches!(
            ActionDistribution::from_params(&params, &spec),
            Err(PpoError::Validation(_))
        ));

        assert!(matches!(
            spec.check_distribution_kinds(&[DistributionKind::Normal]),
            Err(PpoError::Configuration(_))
        ));
        assert!(spec.check_distribution_kinds(&[DistributionKind::Categorical]).is_ok());
    }
}
