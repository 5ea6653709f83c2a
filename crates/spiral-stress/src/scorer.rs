//! Collapses a rollout into the scalar used for elite ranking.

use std::fmt;
use std::sync::Arc;

use spiral_config::RiskMode;

use crate::trajectory::StepRecord;

/// Hook applied to the raw risk score before ranking.
pub trait RiskAdjustment: Send + Sync {
    fn adjust(&self, raw: f64, records: &[StepRecord]) -> f64;
}

/// Leaves the raw score untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAdjustment;

impl RiskAdjustment for NoAdjustment {
    fn adjust(&self, raw: f64, _records: &[StepRecord]) -> f64 {
        raw
    }
}

/// Scales the raw score by the mean simulator-reported reward.
///
/// Base-variant records contribute no reward, so rollouts without an
/// extension are left unchanged.
#[derive(Clone, Copy, Debug)]
pub struct RewardScaled {
    pub factor: f64,
}

impl RiskAdjustment for RewardScaled {
    fn adjust(&self, raw: f64, records: &[StepRecord]) -> f64 {
        let rewards: Vec<f64> = records
            .iter()
            .filter_map(|record| record.extension.map(|ext| ext.reward))
            .collect();
        if rewards.is_empty() {
            return raw;
        }
        let mean = rewards.iter().sum::<f64>() / rewards.len() as f64;
        raw * (1.0 + self.factor * mean)
    }
}

impl<F> RiskAdjustment for F
where
    F: Fn(f64, &[StepRecord]) -> f64 + Send + Sync,
{
    fn adjust(&self, raw: f64, records: &[StepRecord]) -> f64 {
        self(raw, records)
    }
}

#[derive(Clone)]
pub struct TrajectoryScorer {
    mode: RiskMode,
    adjustment: Arc<dyn RiskAdjustment>,
}

impl fmt::Debug for TrajectoryScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrajectoryScorer")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Default for TrajectoryScorer {
    fn default() -> Self {
        Self::new(RiskMode::default())
    }
}

impl TrajectoryScorer {
    pub fn new(mode: RiskMode) -> Self {
        Self {
            mode,
            adjustment: Arc::new(NoAdjustment),
        }
    }

    pub fn with_adjustment(mut self, adjustment: impl RiskAdjustment + 'static) -> Self {
        self.adjustment = Arc::new(adjustment);
        self
    }

    pub fn mode(&self) -> RiskMode {
        self.mode
    }

    /// Score before adjustment. An empty rollout scores `+inf`.
    pub fn raw_score(&self, records: &[StepRecord]) -> f64 {
        match self.mode {
            RiskMode::MinimumRisk => records
                .iter()
                .map(|record| record.risk)
                .fold(f64::INFINITY, f64::min),
            RiskMode::TerminalDistance => records
                .last()
                .map(|record| record.risk)
                .unwrap_or(f64::INFINITY),
        }
    }

    /// Returns `(raw, adjusted)`.
    pub fn score(&self, records: &[StepRecord]) -> (f64, f64) {
        let raw = self.raw_score(records);
        (raw, self.adjustment.adjust(raw, records))
    }
}
