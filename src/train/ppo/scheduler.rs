//! Sequential optimization passes over one fixed batch
//!
//! Each epoch re-scores the same returns and advantages under the current
//! weights and requests one weight update. Epoch `i + 1` starts only after
//! epoch `i` has returned, so its update is already visible.

use tracing::debug;

use super::stats::LossInfo;
use crate::error::Result;

/// Per-epoch and aggregated losses of a scheduler run
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    /// Losses summed over every epoch
    pub total: LossInfo,

    /// Losses of the final epoch
    pub last: LossInfo,
}

/// Runs a fixed number of ordered epochs and sums their losses
#[derive(Debug, Clone, Copy)]
pub struct EpochScheduler {
    num_epochs: usize,
    debug_summaries: bool,
}

impl EpochScheduler {
    /// Create a scheduler for `num_epochs` passes
    pub fn new(num_epochs: usize) -> Self {
        Self { num_epochs, debug_summaries: false }
    }

    /// Log every epoch's losses at debug level
    pub fn with_debug_summaries(mut self, enabled: bool) -> Self {
        self.debug_summaries = enabled;
        self
    }

    /// Number of epochs per run
    pub fn num_epochs(&self) -> usize {
        self.num_epochs
    }

    /// Run `epoch_fn` once per epoch, in order
    ///
    /// `epoch_fn` receives the epoch index and must finish its weight update
    /// before returning. The first error aborts the run.
    pub fn run<F>(&self, mut epoch_fn: F) -> Result<EpochSummary>
    where
        F: FnMut(usize) -> Result<LossInfo>,
    {
        let mut total = LossInfo::zeros();
        let mut last = LossInfo::zeros();

        for epoch in 0..self.num_epochs {
            let info = epoch_fn(epoch)?;

            if self.debug_summaries {
                debug!(
                    epoch,
                    total_loss = info.total_loss,
                    policy_gradient_loss = info.policy_gradient_loss,
                    value_estimation_loss = info.value_estimation_loss,
                    l2_regularization_loss = info.l2_regularization_loss,
                    entropy_regularization_loss = info.entropy_regularization_loss,
                    kl_penalty_loss = info.kl_penalty_loss,
                    clip_fraction = info.clip_fraction,
                    kl_divergence = info.kl_divergence,
                    "epoch finished"
                );
            }

            total += &info;
            last = info;
        }

        Ok(EpochSummary { total, last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PpoError;

    fn info(total_loss: f64) -> LossInfo {
        LossInfo { total_loss, num_epochs: 1, ..LossInfo::zeros() }
    }

    #[test]
    fn test_epochs_run_in_order() {
        let mut seen = Vec::new();
        let summary = EpochScheduler::new(4)
            .run(|epoch| {
                seen.push(epoch);
                Ok(info(epoch as f64))
            })
            .unwrap();

        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(summary.total.total_loss, 6.0);
        assert_eq!(summary.total.num_epochs, 4);
        assert_eq!(summary.last.total_loss, 3.0);
    }

    #[test]
    fn test_single_epoch_total_equals_epoch() {
        let summary = EpochScheduler::new(1).run(|_| Ok(info(1.25))).unwrap();
        assert_eq!(summary.total, summary.last);
    }

    #[test]
    fn test_error_stops_run() {
        let mut calls = 0;
        let result = EpochScheduler::new(5).run(|epoch| {
            calls += 1;
            if epoch == 1 {
                Err(PpoError::Numerical { name: "total_loss".into() })
            } else {
                Ok(info(1.0))
            }
        });

        assert!(matches!(result, Err(PpoError::Numerical { .. })));
        assert_eq!(calls, 2);
    }
}
