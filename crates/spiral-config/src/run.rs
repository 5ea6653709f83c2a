use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Direction in which elite members are ranked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    /// Small scores indicate failure (risk = closeness to a collision).
    #[default]
    Minimize,
    /// Large scores indicate failure (reward-like scores).
    Maximize,
}

impl Objective {
    pub fn from_maximize(maximize: bool) -> Self {
        if maximize {
            Objective::Maximize
        } else {
            Objective::Minimize
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Objective::Minimize => "minimize",
            Objective::Maximize => "maximize",
        }
    }

    /// Orders scores so that the most failure-indicating one sorts first.
    pub fn ordering(&self, lhs: f64, rhs: f64) -> Ordering {
        match self {
            Objective::Minimize => lhs.total_cmp(&rhs),
            Objective::Maximize => rhs.total_cmp(&lhs),
        }
    }

    pub fn prefers(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Objective::Minimize => candidate < incumbent,
            Objective::Maximize => candidate > incumbent,
        }
    }
}

/// How a rollout is collapsed into a single score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RiskMode {
    /// Minimum per-step risk over the (possibly truncated) rollout.
    #[default]
    MinimumRisk,
    /// Risk reported by the final executed step, e.g. distance to the goal.
    TerminalDistance,
}

/// Inclusive bounds applied to every refitted diagonal variance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VarianceClamp {
    pub min: f64,
    pub max: f64,
}

impl Default for VarianceClamp {
    fn default() -> Self {
        Self { min: 1e-6, max: 0.1 }
    }
}

impl VarianceClamp {
    pub fn apply(&self, variance: f64) -> f64 {
        variance.clamp(self.min, self.max)
    }
}

/// Position from which an interrupted run continues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResumePoint {
    pub generation: usize,
    pub sample: usize,
}

impl ResumePoint {
    pub fn is_fresh(&self) -> bool {
        self.generation == 0 && self.sample == 0
    }
}

/// Per-step diagonal Gaussian noise description, replicated over every timestep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoiseModel {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl NoiseModel {
    pub fn isotropic(dim: usize, mean: f64, std: f64) -> Self {
        Self {
            mean: vec![mean; dim],
            std: vec![std; dim],
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn validate(&self, expected_dim: usize) -> Result<(), ConfigError> {
        if self.mean.len() != expected_dim || self.std.len() != expected_dim {
            return Err(ConfigError::NoiseDimension {
                expected: expected_dim,
                mean: self.mean.len(),
                std: self.std.len(),
            });
        }
        if let Some(std) = self
            .std
            .iter()
            .copied()
            .find(|s| !s.is_finite() || *s <= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "noise standard deviations must be positive and finite (got {std})"
            )));
        }
        if self.mean.iter().any(|m| !m.is_finite()) {
            return Err(ConfigError::Invalid(
                "noise means must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_weight_floor() -> f64 {
    1e-8
}

fn default_workers() -> usize {
    1
}

/// Parameters of one cross-entropy stress-test run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Rollouts per generation (`m`).
    pub population: usize,
    /// Elite members used to refit the proposal (`m_elite`).
    pub elite: usize,
    /// Generation budget (`kmax`).
    pub generations: usize,
    /// Timesteps per rollout (`T`).
    pub steps: usize,
    /// Noise dimensionality per timestep (`D`).
    pub noise_dim: usize,
    #[serde(default)]
    pub variance_clamp: VarianceClamp,
    #[serde(default = "default_weight_floor")]
    pub weight_floor: f64,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub risk_mode: RiskMode,
    #[serde(default)]
    pub resume: ResumePoint,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub log_path: PathBuf,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

impl RunConfig {
    /// Minimal configuration with defaults for every optional field.
    pub fn new(
        population: usize,
        elite: usize,
        generations: usize,
        steps: usize,
        noise_dim: usize,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            population,
            elite,
            generations,
            steps,
            noise_dim,
            variance_clamp: VarianceClamp::default(),
            weight_floor: default_weight_floor(),
            objective: Objective::default(),
            risk_mode: RiskMode::default(),
            resume: ResumePoint::default(),
            seed: None,
            workers: default_workers(),
            log_path: log_path.into(),
            checkpoint_path: None,
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("population", self.population),
            ("generations", self.generations),
            ("steps", self.steps),
            ("noise_dim", self.noise_dim),
            ("workers", self.workers),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be non-zero")));
            }
        }
        if self.elite == 0 || self.elite > self.population {
            return Err(ConfigError::Invalid(format!(
                "elite count must lie in 1..={} (got {})",
                self.population, self.elite
            )));
        }
        let clamp = self.variance_clamp;
        if !clamp.min.is_finite() || !clamp.max.is_finite() || clamp.min < 0.0 || clamp.min > clamp.max
        {
            return Err(ConfigError::Invalid(format!(
                "variance clamp must satisfy 0 <= min <= max (got [{}, {}])",
                clamp.min, clamp.max
            )));
        }
        if !self.weight_floor.is_finite() || self.weight_floor <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "weight floor must be positive (got {})",
                self.weight_floor
            )));
        }
        if self.resume.generation >= self.generations {
            return Err(ConfigError::Invalid(format!(
                "resume generation {} exceeds the generation budget {}",
                self.resume.generation, self.generations
            )));
        }
        if self.resume.sample >= self.population {
            return Err(ConfigError::Invalid(format!(
                "resume sample {} exceeds the population size {}",
                self.resume.sample, self.population
            )));
        }
        Ok(())
    }
}

/// Parameters of a plain Monte-Carlo baseline under the nominal distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonteCarloConfig {
    pub simulations: usize,
    /// Index of the first simulation; earlier ones are assumed logged already.
    #[serde(default)]
    pub start_iter: usize,
    pub steps: usize,
    pub noise_dim: usize,
    #[serde(default)]
    pub risk_mode: RiskMode,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub log_path: PathBuf,
}

impl MonteCarloConfig {
    pub fn new(
        simulations: usize,
        steps: usize,
        noise_dim: usize,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            simulations,
            start_iter: 0,
            steps,
            noise_dim,
            risk_mode: RiskMode::default(),
            seed: None,
            workers: default_workers(),
            log_path: log_path.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_iter >= self.simulations {
            return Err(ConfigError::Invalid(format!(
                "start_iter {} leaves no simulations out of {}",
                self.start_iter, self.simulations
            )));
        }
        for (field, value) in [
            ("steps", self.steps),
            ("noise_dim", self.noise_dim),
            ("workers", self.workers),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Errors raised while loading or validating a run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("noise model must have {expected} dimensions (mean has {mean}, std has {std})")]
    NoiseDimension {
        expected: usize,
        mean: usize,
        std: usize,
    },
}
