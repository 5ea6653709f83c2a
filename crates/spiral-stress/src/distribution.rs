//! Per-timestep multivariate Gaussians used as the nominal (target) and
//! proposal distributions over disturbance sequences.
//!
//! Every constructor validates its covariance, so a degenerate refit surfaces
//! as [`StressError::InvalidDistribution`] at construction time instead of as
//! `NaN`s deep inside sampling or density evaluation.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use spiral_config::{rollout_rng, NoiseModel};

use crate::error::{StressError, StressResult};

/// `ln(2π)`
const LN_2PI: f64 = 1.837_877_066_409_345_5;
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Multivariate Gaussian for a single timestep.
#[derive(Clone, Debug)]
pub struct StepGaussian {
    /// Timestep this Gaussian describes; reassigned when placed in a sequence.
    index: usize,
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    lower: DMatrix<f64>,
    log_det: f64,
}

impl StepGaussian {
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> StressResult<Self> {
        Self::build(0, mean, covariance)
    }

    /// Gaussian with independent dimensions.
    pub fn diagonal(mean: &[f64], variances: &[f64]) -> StressResult<Self> {
        Self::diagonal_at(0, mean, variances)
    }

    pub(crate) fn diagonal_at(step: usize, mean: &[f64], variances: &[f64]) -> StressResult<Self> {
        if mean.len() != variances.len() {
            return Err(StressError::DimensionMismatch {
                context: "diagonal covariance",
                expected: mean.len(),
                actual: variances.len(),
            });
        }
        Self::build(
            step,
            DVector::from_column_slice(mean),
            DMatrix::from_diagonal(&DVector::from_column_slice(variances)),
        )
    }

    fn build(step: usize, mean: DVector<f64>, covariance: DMatrix<f64>) -> StressResult<Self> {
        let dim = mean.len();
        if dim == 0 {
            return Err(StressError::invalid(step, "zero-dimensional distribution"));
        }
        if covariance.nrows() != dim || covariance.ncols() != dim {
            return Err(StressError::invalid(
                step,
                format!(
                    "covariance is {}x{} but the mean has {dim} entries",
                    covariance.nrows(),
                    covariance.ncols()
                ),
            ));
        }
        if mean.iter().any(|v| !v.is_finite()) {
            return Err(StressError::invalid(step, "mean has non-finite entries"));
        }
        if covariance.iter().any(|v| !v.is_finite()) {
            return Err(StressError::invalid(step, "covariance has non-finite entries"));
        }
        for i in 0..dim {
            for j in (i + 1)..dim {
                let (a, b) = (covariance[(i, j)], covariance[(j, i)]);
                let scale = 1.0_f64.max(a.abs()).max(b.abs());
                if (a - b).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(StressError::invalid(
                        step,
                        format!("covariance is not symmetric at ({i}, {j})"),
                    ));
                }
            }
        }
        // A singular covariance has no density, so semi-definite is not enough here.
        let lower = covariance
            .clone()
            .cholesky()
            .map(|chol| chol.l())
            .filter(|l| l.diagonal().iter().all(|d| *d > 0.0))
            .ok_or_else(|| StressError::invalid(step, "covariance is not positive definite"))?;
        let log_det = 2.0 * lower.diagonal().iter().map(|d| d.ln()).sum::<f64>();
        Ok(Self {
            index: step,
            mean,
            covariance,
            lower,
            log_det,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn variances(&self) -> Vec<f64> {
        self.covariance.diagonal().iter().copied().collect()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let z = DVector::from_iterator(
            self.dim(),
            (0..self.dim()).map(|_| -> f64 { StandardNormal.sample(&mut *rng) }),
        );
        let draw = &self.mean + &self.lower * z;
        draw.iter().copied().collect()
    }

    pub fn log_prob(&self, x: &[f64]) -> StressResult<f64> {
        if x.len() != self.dim() {
            return Err(StressError::DimensionMismatch {
                context: "log density input",
                expected: self.dim(),
                actual: x.len(),
            });
        }
        let diff = DVector::from_column_slice(x) - &self.mean;
        let whitened = self
            .lower
            .solve_lower_triangular(&diff)
            .ok_or_else(|| StressError::invalid(self.index, "triangular solve failed"))?;
        let mahalanobis = whitened.norm_squared();
        Ok(-0.5 * (self.dim() as f64 * LN_2PI + self.log_det + mahalanobis))
    }

    pub fn state(&self) -> GaussianState {
        GaussianState {
            mean: self.mean.iter().copied().collect(),
            covariance: self
                .covariance
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
        }
    }

    fn from_state_at(step: usize, state: &GaussianState) -> StressResult<Self> {
        let dim = state.mean.len();
        if state.covariance.len() != dim || state.covariance.iter().any(|row| row.len() != dim) {
            return Err(StressError::invalid(step, "covariance rows do not match the mean"));
        }
        let flat: Vec<f64> = state.covariance.iter().flatten().copied().collect();
        Self::build(
            step,
            DVector::from_vec(state.mean.clone()),
            DMatrix::from_row_slice(dim, dim, &flat),
        )
    }
}

/// Serialisable form of a [`StepGaussian`]; covariance is stored row-major.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GaussianState {
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

/// Serialisable form of a [`GaussianSequence`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SequenceState {
    pub steps: Vec<GaussianState>,
}

/// Independent per-timestep Gaussians over a disturbance trajectory.
///
/// Sequences are replaced, never mutated, when the proposal is refitted so
/// that every generation's distribution stays available for audit.
#[derive(Clone, Debug)]
pub struct GaussianSequence {
    steps: Vec<StepGaussian>,
}

impl GaussianSequence {
    pub fn new(mut steps: Vec<StepGaussian>) -> StressResult<Self> {
        let first = steps.first().ok_or(StressError::EmptyDistribution)?;
        let dim = first.dim();
        if let Some(bad) = steps.iter().find(|step| step.dim() != dim) {
            return Err(StressError::DimensionMismatch {
                context: "sequence step",
                expected: dim,
                actual: bad.dim(),
            });
        }
        for (index, step) in steps.iter_mut().enumerate() {
            step.index = index;
        }
        Ok(Self { steps })
    }

    /// Replicates a diagonal noise model over `steps` timesteps.
    pub fn from_noise_model(model: &NoiseModel, steps: usize) -> StressResult<Self> {
        model.validate(model.dim())?;
        let variances: Vec<f64> = model.std.iter().map(|s| s * s).collect();
        let steps = (0..steps)
            .map(|step| StepGaussian::diagonal_at(step, &model.mean, &variances))
            .collect::<StressResult<Vec<_>>>()?;
        Self::new(steps)
    }

    pub fn from_state(state: &SequenceState) -> StressResult<Self> {
        let steps = state
            .steps
            .iter()
            .enumerate()
            .map(|(step, s)| StepGaussian::from_state_at(step, s))
            .collect::<StressResult<Vec<_>>>()?;
        Self::new(steps)
    }

    pub fn state(&self) -> SequenceState {
        SequenceState {
            steps: self.steps.iter().map(StepGaussian::state).collect(),
        }
    }

    /// Number of timesteps `T`.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Noise dimensionality `D`.
    pub fn dim(&self) -> usize {
        self.steps[0].dim()
    }

    pub fn step(&self, index: usize) -> &StepGaussian {
        &self.steps[index]
    }

    pub fn steps(&self) -> &[StepGaussian] {
        &self.steps
    }

    pub fn sample_step<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Vec<f64> {
        self.steps[index].sample(rng)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Vec<f64>> {
        self.steps.iter().map(|step| step.sample(rng)).collect()
    }

    /// Per-step log densities of a (possibly truncated) trajectory and their sum.
    pub fn log_prob(&self, trajectory: &[Vec<f64>]) -> StressResult<(Vec<f64>, f64)> {
        if trajectory.len() > self.len() {
            return Err(StressError::DimensionMismatch {
                context: "trajectory length",
                expected: self.len(),
                actual: trajectory.len(),
            });
        }
        let per_step = trajectory
            .iter()
            .zip(&self.steps)
            .map(|(x, step)| step.log_prob(x))
            .collect::<StressResult<Vec<_>>>()?;
        let total = per_step.iter().sum();
        Ok((per_step, total))
    }

    pub fn means(&self) -> Vec<Vec<f64>> {
        self.steps
            .iter()
            .map(|step| step.mean().iter().copied().collect())
            .collect()
    }

    pub fn variances(&self) -> Vec<Vec<f64>> {
        self.steps.iter().map(StepGaussian::variances).collect()
    }
}

/// The one random source shared by the target and proposal distributions.
///
/// Each rollout draws from its own sub-stream addressed by
/// `(generation, member)`, which keeps streams disjoint across workers and
/// lets a resumed run reproduce the exact draws of an uninterrupted one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseSource {
    base_seed: u64,
}

impl NoiseSource {
    pub fn new(base_seed: u64) -> Self {
        Self { base_seed }
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    pub fn rollout_stream(&self, generation: usize, member: usize) -> StdRng {
        rollout_rng(self.base_seed, generation, member)
    }
}
