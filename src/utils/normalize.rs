//! Streaming normalization for rewards and observations
//!
//! This module provides a running mean and variance normalizer over a
//! stream of tensors, which keeps reward and observation scales stable
//! across training calls.

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{PpoError, Result};

/// Default epsilon added to the running variance before taking its root
pub const DEFAULT_VARIANCE_EPSILON: f64 = 1e-3;

/// Prior sample count, keeps the first merge well defined
const INITIAL_COUNT: f64 = 1e-4;

/// Serializable snapshot of a [`StreamingNormalizer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerStats {
    /// Shape of a single sample (the non-outer dimensions)
    pub shape: Vec<i64>,

    /// Running mean, flattened in row-major order
    pub mean: Vec<f64>,

    /// Running (population) variance, flattened in row-major order
    pub variance: Vec<f64>,

    /// Number of samples folded in so far
    pub count: f64,
}

/// Running mean and variance normalizer over a tensor stream
///
/// Statistics are merged batch by batch with the parallel-axis formula,
/// so an update never revisits earlier samples.
///
/// The normalizer is owned by the agent and has a single writer:
/// [`update`](Self::update) is called once at the end of each training
/// call, while [`normalize`](Self::normalize) reads whatever snapshot was
/// current before that update.
#[derive(Debug)]
pub struct StreamingNormalizer {
    shape: Vec<i64>,
    mean: Tensor,
    var: Tensor,
    count: f64,
    epsilon: f64,
}

impl StreamingNormalizer {
    /// Create a new normalizer
    ///
    /// # Arguments
    /// * `shape` - Shape of one sample; `&[]` for a scalar stream such as rewards
    pub fn new(shape: &[i64]) -> Self {
        Self::with_epsilon(shape, DEFAULT_VARIANCE_EPSILON)
    }

    /// Create a new normalizer with a custom variance epsilon
    pub fn with_epsilon(shape: &[i64], epsilon: f64) -> Self {
        let options = (Kind::Double, Device::Cpu);
        Self {
            shape: shape.to_vec(),
            mean: Tensor::zeros(shape, options),
            var: Tensor::ones(shape, options),
            count: INITIAL_COUNT,
            epsilon,
        }
    }

    /// Rebuild a normalizer from a snapshot
    pub fn from_stats(stats: &NormalizerStats, epsilon: f64) -> Result<Self> {
        let numel: i64 = stats.shape.iter().product();
        if stats.mean.len() as i64 != numel || stats.variance.len() as i64 != numel {
            return Err(PpoError::validation(format!(
                "normalizer stats for shape {:?} need {} values, got mean={} variance={}",
                stats.shape,
                numel,
                stats.mean.len(),
                stats.variance.len()
            )));
        }
        if stats.count <= 0.0 {
            return Err(PpoError::validation("normalizer sample count must be positive"));
        }

        Ok(Self {
            shape: stats.shape.clone(),
            mean: Tensor::from_slice(&stats.mean).reshape(stats.shape.as_slice()),
            var: Tensor::from_slice(&stats.variance).reshape(stats.shape.as_slice()),
            count: stats.count,
            epsilon,
        })
    }

    /// Normalize a tensor with the current statistics
    ///
    /// Computes `(x - mean) / sqrt(var + epsilon)` and clips the result to
    /// `[-clip_value, clip_value]` when `clip_value > 0`.
    ///
    /// # Arguments
    /// * `x` - Tensor whose trailing dimensions equal the sample shape
    /// * `center_mean` - If false the mean is not subtracted (scale-only)
    /// * `clip_value` - Symmetric clip bound, 0 disables clipping
    pub fn normalize(&self, x: &Tensor, center_mean: bool, clip_value: f64) -> Result<Tensor> {
        self.check_trailing_shape(x)?;

        let kind = x.kind();
        let device = x.device();
        let std = self.std().to_device(device).to_kind(kind);

        let centered = if center_mean {
            x - self.mean.to_device(device).to_kind(kind)
        } else {
            x.shallow_clone()
        };
        let normalized = centered / std;

        if clip_value > 0.0 {
            Ok(normalized.clamp(-clip_value, clip_value))
        } else {
            Ok(normalized)
        }
    }

    /// Fold a batch of samples into the running statistics
    ///
    /// # Arguments
    /// * `x` - Batch of samples `[outer..., sample_shape...]`
    /// * `outer_dims` - Leading dimensions to reduce over, e.g. `&[0, 1]`
    ///   for a `[batch, time]` batch
    pub fn update(&mut self, x: &Tensor, outer_dims: &[i64]) -> Result<()> {
        let size = x.size();
        let outer_rank = outer_dims.len();

        if outer_dims.iter().enumerate().any(|(i, &d)| d != i as i64) {
            return Err(PpoError::validation(format!(
                "outer dims must be the leading dimensions, got {:?}",
                outer_dims
            )));
        }
        if size.len() != outer_rank + self.shape.len() {
            return Err(PpoError::validation(format!(
                "expected rank {} ({} outer + sample shape {:?}), got shape {:?}",
                outer_rank + self.shape.len(),
                outer_rank,
                self.shape,
                size
            )));
        }
        self.check_trailing_shape(x)?;

        let batch_count: i64 = size[..outer_rank].iter().product();
        if batch_count == 0 {
            return Ok(());
        }

        let x = x.detach().to_device(Device::Cpu).to_kind(Kind::Double);
        let (batch_mean, batch_var) = if outer_rank == 0 {
            (x.shallow_clone(), x.zeros_like())
        } else {
            let mean = x.mean_dim(outer_dims, false, Kind::Double);
            let var = (&x - &mean).square().mean_dim(outer_dims, false, Kind::Double);
            (mean, var)
        };

        // Merge the two moment estimates (parallel axis theorem)
        let n = batch_count as f64;
        let total = self.count + n;
        let delta = &batch_mean - &self.mean;

        let mean = &self.mean + &delta * (n / total);
        let m_a = &self.var * self.count;
        let m_b = batch_var * n;
        let m2 = m_a + m_b + delta.square() * (self.count * n / total);

        self.mean = mean;
        self.var = m2 / total;
        self.count = total;

        Ok(())
    }

    /// Snapshot the statistics for checkpointing
    pub fn stats(&self) -> Result<NormalizerStats> {
        Ok(NormalizerStats {
            shape: self.shape.clone(),
            mean: Vec::<f64>::try_from(self.mean.reshape([-1]))?,
            variance: Vec::<f64>::try_from(self.var.reshape([-1]))?,
            count: self.count,
        })
    }

    /// Sample shape this normalizer expects
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Get current mean
    pub fn mean(&self) -> Tensor {
        self.mean.shallow_clone()
    }

    /// Get current variance
    pub fn variance(&self) -> Tensor {
        self.var.shallow_clone()
    }

    /// Get current standard deviation (including epsilon)
    pub fn std(&self) -> Tensor {
        (&self.var + self.epsilon).sqrt()
    }

    /// Get number of samples seen
    pub fn count(&self) -> f64 {
        self.count
    }

    fn check_trailing_shape(&self, x: &Tensor) -> Result<()> {
        let size = x.size();
        let rank = self.shape.len();
        if size.len() < rank || size[size.len() - rank..] != self.shape[..] {
            return Err(PpoError::validation(format!(
                "tensor of shape {:?} does not end with normalizer shape {:?}",
                size, self.shape
            )));
        }
        Ok(())
    }
}
