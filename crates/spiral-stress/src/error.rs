use std::path::PathBuf;

use spiral_config::ConfigError;
use thiserror::Error;

/// Errors surfaced by the stress-testing core.
#[derive(Debug, Error)]
pub enum StressError {
    /// A covariance failed validation while building a per-step Gaussian.
    /// The engine treats this as a degenerate fit and aborts the run.
    #[error("invalid distribution at step {step}: {reason}")]
    InvalidDistribution { step: usize, reason: String },
    #[error("a distribution sequence needs at least one timestep")]
    EmptyDistribution,
    #[error("{context}: expected dimension {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    /// The simulator returned a step variant other than the one it declared.
    #[error(
        "simulator output kind changed mid-run at generation {generation}, member {member}, step {step}"
    )]
    OutputKindMismatch {
        generation: usize,
        member: usize,
        step: usize,
    },
    /// Fatal failure on the append-only trajectory log.
    #[error(
        "trajectory log write failed at generation {generation}, member {member}, step {step}: {source}"
    )]
    LogIo {
        generation: usize,
        member: usize,
        step: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("trajectory log {path:?}: {source}")]
    LogOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed trajectory log line {line}: {reason}")]
    LogParse { line: usize, reason: String },
    #[error("checkpoint {path:?}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },
    #[error("cannot resume: {0}")]
    ResumeMismatch(String),
    #[error("simulator pool must contain at least one instance")]
    EmptySimulatorPool,
    #[error("evaluation cancelled after a fatal error in another worker")]
    Cancelled,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StressError {
    pub(crate) fn invalid(step: usize, reason: impl Into<String>) -> Self {
        StressError::InvalidDistribution {
            step,
            reason: reason.into(),
        }
    }

    /// True for the degenerate-fit signal that aborts a run without raising.
    pub fn is_degenerate(&self) -> bool {
        matches!(self, StressError::InvalidDistribution { .. })
    }
}

/// Convenient result alias for the stress-testing core.
pub type StressResult<T> = Result<T, StressError>;
