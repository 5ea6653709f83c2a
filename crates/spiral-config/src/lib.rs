//! Shared configuration for SpiralTorch stress-testing runs: the run
//! parameters, seed derivation for reproducible rollouts, and the tracing
//! subscriber used by binaries.

pub mod determinism;
pub mod run;
pub mod tracing;

pub use determinism::{rollout_rng, stream_seed, DeterminismConfig};
pub use run::{
    ConfigError, MonteCarloConfig, NoiseModel, Objective, ResumePoint, RiskMode, RunConfig,
    VarianceClamp,
};
pub use tracing::{flush_tracing, init_tracing, InitError, TracingOptions};
