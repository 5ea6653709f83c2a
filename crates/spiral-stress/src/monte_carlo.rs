//! Plain Monte-Carlo baseline: rollouts drawn straight from the nominal
//! distribution, logged in the same layout as a cross-entropy run.

use serde::{Deserialize, Serialize};
use spiral_config::{DeterminismConfig, MonteCarloConfig};
use tracing::info;

use crate::distribution::{GaussianSequence, NoiseSource};
use crate::engine::RunStats;
use crate::error::{StressError, StressResult};
use crate::evaluator::{PopulationEvaluator, Rollout};
use crate::log::{LogSchema, TrajectoryLog};
use crate::scorer::TrajectoryScorer;
use crate::simulator::Simulator;
use crate::tracker::{NoOpTracker, StressTracker};

/// Monte-Carlo rows are logged under this generation index.
pub const MONTE_CARLO_GENERATION: usize = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloReport {
    pub seed: u64,
    pub simulations: usize,
    pub failures: usize,
    pub failure_probability: f64,
    /// Binomial standard error of `failure_probability`.
    pub standard_error: f64,
    pub stats: RunStats,
}

impl MonteCarloReport {
    fn from_stats(seed: u64, stats: RunStats) -> Self {
        let n = stats.simulations as f64;
        let p = if stats.simulations == 0 {
            0.0
        } else {
            stats.collisions as f64 / n
        };
        let standard_error = if stats.simulations == 0 {
            0.0
        } else {
            (p * (1.0 - p) / n).sqrt()
        };
        Self {
            seed,
            simulations: stats.simulations,
            failures: stats.collisions,
            failure_probability: p,
            standard_error,
            stats,
        }
    }
}

pub struct MonteCarloEstimator<S: Simulator> {
    config: MonteCarloConfig,
    target: GaussianSequence,
    simulators: Vec<S>,
    scorer: TrajectoryScorer,
    tracker: Box<dyn StressTracker>,
    noise: NoiseSource,
    schema: LogSchema,
}

impl<S: Simulator> MonteCarloEstimator<S> {
    pub fn new(
        config: MonteCarloConfig,
        target: GaussianSequence,
        mut simulators: Vec<S>,
    ) -> StressResult<Self> {
        config.validate()?;
        if target.len() != config.steps || target.dim() != config.noise_dim {
            return Err(StressError::DimensionMismatch {
                context: "nominal distribution",
                expected: config.steps * config.noise_dim,
                actual: target.len() * target.dim(),
            });
        }
        let first = simulators.first().ok_or(StressError::EmptySimulatorPool)?;
        let schema = LogSchema::for_simulator(config.noise_dim, first);
        let determinism = DeterminismConfig::from_env();
        let workers = determinism
            .effective_workers(config.workers)
            .min(simulators.len());
        simulators.truncate(workers);
        let noise = NoiseSource::new(determinism.resolve_seed(config.seed));
        Ok(Self {
            scorer: TrajectoryScorer::new(config.risk_mode),
            config,
            target,
            simulators,
            tracker: Box::new(NoOpTracker),
            noise,
            schema,
        })
    }

    pub fn with_tracker(mut self, tracker: Box<dyn StressTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn seed(&self) -> u64 {
        self.noise.base_seed()
    }

    /// Runs simulations `start_iter..simulations` and estimates the failure
    /// probability over them.
    pub fn run(&mut self) -> StressResult<MonteCarloReport> {
        let log = TrajectoryLog::open(&self.config.log_path, self.schema)?;
        let rollout = Rollout {
            schema: self.schema,
            target: &self.target,
            proposal: &self.target,
            scorer: &self.scorer,
        };
        let evaluator = PopulationEvaluator::new(rollout, self.noise, &log);
        let outcomes = evaluator.evaluate(
            MONTE_CARLO_GENERATION,
            self.config.start_iter..self.config.simulations,
            &mut self.simulators,
            self.tracker.as_mut(),
        )?;
        let mut stats = RunStats::default();
        for outcome in &outcomes {
            stats.record(outcome);
        }
        let report = MonteCarloReport::from_stats(self.seed(), stats);
        info!(
            simulations = report.simulations,
            failures = report.failures,
            failure_probability = report.failure_probability,
            standard_error = report.standard_error,
            "monte-carlo baseline finished"
        );
        Ok(report)
    }
}
