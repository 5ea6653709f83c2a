use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::engine::GenerationSummary;
use crate::trajectory::{SimulationOutcome, StepRecord};

/// Emitted once per rollout that ends in a collision.
#[derive(Debug, Clone, Copy)]
pub struct FailureEvent<'a> {
    pub generation: usize,
    pub member: usize,
    /// Step at which the collision was reported.
    pub step: usize,
    pub records: &'a [StepRecord],
}

/// Observer of a stress-test run. Every hook defaults to a no-op.
///
/// Hooks may be invoked from worker threads, one call at a time.
pub trait StressTracker: Send {
    fn on_failure(&mut self, _event: FailureEvent<'_>) {}
    fn on_member_end(&mut self, _outcome: &SimulationOutcome) {}
    fn on_generation_end(&mut self, _summary: &GenerationSummary) {}
    fn on_checkpoint(&mut self, _checkpoint: &Checkpoint) {}
}

pub struct NoOpTracker;
impl StressTracker for NoOpTracker {}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub generation: usize,
    pub member: usize,
    pub step: usize,
    pub log_likelihood_p: f64,
}

/// Collects every failure it observes. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct FailureCollector {
    failures: Arc<Mutex<Vec<FailureRecord>>>,
}

impl FailureCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl StressTracker for FailureCollector {
    fn on_failure(&mut self, event: FailureEvent<'_>) {
        let log_likelihood_p = event
            .records
            .last()
            .map(|record| record.cumulative_log_p)
            .unwrap_or(0.0);
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(FailureRecord {
                generation: event.generation,
                member: event.member,
                step: event.step,
                log_likelihood_p,
            });
    }
}
