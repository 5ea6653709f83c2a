//! Weighted maximum-likelihood refit of the proposal distribution.

use spiral_config::VarianceClamp;

use crate::distribution::{GaussianSequence, StepGaussian};
use crate::error::StressResult;
use crate::trajectory::SimulationOutcome;
use crate::weights::StepWeights;

/// Below this, the unbiased correction `1 - sum(w^2)` is treated as zero.
const UNBIASED_EPS: f64 = 1e-12;

pub fn weighted_mean(samples: &[&[f64]], weights: &[f64]) -> Vec<f64> {
    let dim = samples.first().map(|s| s.len()).unwrap_or(0);
    let mut mean = vec![0.0; dim];
    for (sample, w) in samples.iter().zip(weights) {
        for (m, x) in mean.iter_mut().zip(sample.iter()) {
            *m += w * x;
        }
    }
    mean
}

/// Per-dimension weighted variance with the reliability-weights correction.
///
/// Falls back to the biased estimator when a single weight carries
/// (almost) all of the mass.
pub fn weighted_diagonal_variance(samples: &[&[f64]], weights: &[f64], mean: &[f64]) -> Vec<f64> {
    let mut variance = vec![0.0; mean.len()];
    for (sample, w) in samples.iter().zip(weights) {
        for ((v, x), m) in variance.iter_mut().zip(sample.iter()).zip(mean) {
            *v += w * (x - m).powi(2);
        }
    }
    let denom = 1.0 - weights.iter().map(|w| w * w).sum::<f64>();
    if denom > UNBIASED_EPS {
        variance.iter_mut().for_each(|v| *v /= denom);
    }
    variance
}

#[derive(Debug, Clone, Copy)]
pub struct DistributionUpdater {
    clamp: VarianceClamp,
}

impl DistributionUpdater {
    pub fn new(clamp: VarianceClamp) -> Self {
        Self { clamp }
    }

    pub fn clamp(&self) -> VarianceClamp {
        self.clamp
    }

    /// Fits one step from weighted samples; the result is diagonal.
    pub fn refit_step(&self, step: usize, samples: &[&[f64]], weights: &[f64]) -> StressResult<StepGaussian> {
        let mean = weighted_mean(samples, weights);
        let variances: Vec<f64> = weighted_diagonal_variance(samples, weights, &mean)
            .into_iter()
            .map(|v| self.clamp.apply(v))
            .collect();
        StepGaussian::diagonal_at(step, &mean, &variances)
    }

    /// Builds the next proposal. Steps no elite reached keep `current`'s
    /// distribution.
    pub fn refit(
        &self,
        current: &GaussianSequence,
        elites: &[&SimulationOutcome],
        weights: &[StepWeights],
    ) -> StressResult<GaussianSequence> {
        let steps = current
            .steps()
            .iter()
            .enumerate()
            .map(|(step, existing)| match weights.get(step) {
                Some(step_weights) if !step_weights.is_empty() => {
                    let samples: Vec<&[f64]> = step_weights
                        .contributors
                        .iter()
                        .map(|&position| elites[position].records[step].noise.as_slice())
                        .collect();
                    self.refit_step(step, &samples, &step_weights.weights)
                }
                _ => Ok(existing.clone()),
            })
            .collect::<StressResult<Vec<_>>>()?;
        GaussianSequence::new(steps)
    }
}
