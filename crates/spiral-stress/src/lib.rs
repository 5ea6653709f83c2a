//! Adaptive importance sampling for rare-failure stress testing.
//!
//! A [`CemEngine`] searches the space of per-timestep disturbance
//! distributions with the cross-entropy method: every generation samples
//! disturbance trajectories from a proposal, runs them through a
//! [`Simulator`], keeps the most failure-indicating rollouts and refits the
//! proposal to them with likelihood-ratio weights against the nominal
//! distribution. Every executed step is appended to a [`TrajectoryLog`] so a
//! run can be audited, resumed or replayed.

pub mod analysis;
pub mod checkpoint;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod log;
pub mod monte_carlo;
pub mod replay;
pub mod scorer;
pub mod simulator;
pub mod tracker;
pub mod trajectory;
pub mod updater;
pub mod weights;

pub use analysis::{best_generation, RunSummary};
pub use checkpoint::Checkpoint;
pub use distribution::{GaussianSequence, GaussianState, NoiseSource, SequenceState, StepGaussian};
pub use engine::{BestSolution, CemEngine, CemReport, EngineState, GenerationSummary, RunStats};
pub use error::{StressError, StressResult};
pub use evaluator::{PopulationEvaluator, Rollout};
pub use log::{LogSchema, TrajectoryLog};
pub use monte_carlo::{MonteCarloEstimator, MonteCarloReport};
pub use replay::{collided_sequences, replay, CollidedSequence, ReplayReport};
pub use scorer::{NoAdjustment, RewardScaled, RiskAdjustment, TrajectoryScorer};
pub use simulator::{BaseStep, OutputKind, Simulator, StepExtension, StepOutcome, ToySimulator};
pub use tracker::{FailureCollector, FailureEvent, FailureRecord, NoOpTracker, StressTracker};
pub use trajectory::{Population, SimulationOutcome, StepRecord, Trajectory};
pub use updater::DistributionUpdater;
pub use weights::{log_sum_exp, normalize_log_weights, select_elites, Reweighter, StepWeights};

pub use spiral_config::{MonteCarloConfig, NoiseModel, Objective, RiskMode, RunConfig};
