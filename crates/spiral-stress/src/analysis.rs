use crate::distribution::SequenceState;
use crate::engine::{BestSolution, CemReport, EngineState, GenerationSummary};
use serde::{Deserialize, Serialize};
use spiral_config::Objective;

/// Serialisable digest of a cross-entropy run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub state: EngineState,
    pub seed: u64,
    pub objective: Objective,
    pub generations_completed: usize,
    pub simulations: usize,
    pub collisions: usize,
    pub collision_rate: f64,
    pub mean_steps_to_collision: Option<f64>,
    pub best: Option<BestSolution>,
    pub best_generation: Option<usize>,
    pub final_proposal: SequenceState,
    pub generations: Vec<GenerationSummary>,
}

impl RunSummary {
    pub fn new(report: &CemReport, objective: Objective) -> Self {
        Self {
            state: report.state.clone(),
            seed: report.seed,
            objective,
            generations_completed: report.history.len().saturating_sub(1),
            simulations: report.stats.simulations,
            collisions: report.stats.collisions,
            collision_rate: report.stats.collision_rate(),
            mean_steps_to_collision: report.stats.mean_steps_to_collision(),
            best: report.best.clone(),
            best_generation: best_generation(&report.summaries, objective)
                .map(|summary| summary.generation),
            final_proposal: report.proposal.state(),
            generations: report.summaries.clone(),
        }
    }

    pub fn has_best(&self) -> bool {
        self.best.is_some()
    }
}

/// Generation whose top elite was the most failure-indicating.
pub fn best_generation(
    summaries: &[GenerationSummary],
    objective: Objective,
) -> Option<&GenerationSummary> {
    summaries
        .iter()
        .filter(|summary| !summary.best_elite_risk.is_nan())
        .fold(None, |best: Option<&GenerationSummary>, summary| match best {
            None => Some(summary),
            Some(incumbent) => {
                if objective.prefers(summary.best_elite_risk, incumbent.best_elite_risk) {
                    Some(summary)
                } else {
                    Some(incumbent)
                }
            }
        })
}
