use serde::{Deserialize, Serialize};

use crate::simulator::StepExtension;

/// One disturbance vector per executed timestep.
pub type Trajectory = Vec<Vec<f64>>;

/// One executed timestep of one rollout; one row of the trajectory log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub generation: usize,
    pub member: usize,
    pub step: usize,
    pub noise: Vec<f64>,
    pub extension: Option<StepExtension>,
    pub risk: f64,
    pub state: Vec<f64>,
    /// Step log-likelihood under the target distribution `p`.
    pub log_p: f64,
    /// Step log-likelihood under the proposal `q` that produced the noise.
    pub log_q: f64,
    pub cumulative_log_p: f64,
    pub cumulative_log_q: f64,
    /// Collision reported by this step.
    pub collided: bool,
    /// Whether the rollout this step belongs to ended in a collision.
    pub simulation_collided: bool,
}

/// A finished (possibly truncated) rollout and its score.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationOutcome {
    pub generation: usize,
    pub member: usize,
    pub records: Vec<StepRecord>,
    pub collided: bool,
    /// Score before any risk adjustment.
    pub raw_score: f64,
    /// Score used for elite ranking.
    pub score: f64,
    pub steps_to_collision: Option<usize>,
}

impl SimulationOutcome {
    pub fn steps_executed(&self) -> usize {
        self.records.len()
    }

    pub fn noise_at(&self, step: usize) -> Option<&[f64]> {
        self.records.get(step).map(|record| record.noise.as_slice())
    }

    pub fn trajectory(&self) -> Trajectory {
        self.records.iter().map(|record| record.noise.clone()).collect()
    }

    /// Trajectory log-likelihood under the target distribution.
    pub fn log_likelihood_p(&self) -> f64 {
        self.records
            .last()
            .map(|record| record.cumulative_log_p)
            .unwrap_or(0.0)
    }

    /// Trajectory log-likelihood under the proposal distribution.
    pub fn log_likelihood_q(&self) -> f64 {
        self.records
            .last()
            .map(|record| record.cumulative_log_q)
            .unwrap_or(0.0)
    }
}

/// All rollouts of one generation, ordered by member index.
pub type Population = Vec<SimulationOutcome>;
