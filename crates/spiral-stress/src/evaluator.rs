//! Runs populations of rollouts against the simulator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::distribution::{GaussianSequence, NoiseSource};
use crate::error::{StressError, StressResult};
use crate::log::{LogSchema, TrajectoryLog};
use crate::scorer::TrajectoryScorer;
use crate::simulator::Simulator;
use crate::tracker::{FailureEvent, StressTracker};
use crate::trajectory::{SimulationOutcome, StepRecord};

/// Everything needed to execute and score one rollout.
#[derive(Clone, Copy)]
pub struct Rollout<'a> {
    pub schema: LogSchema,
    /// Nominal distribution `p`.
    pub target: &'a GaussianSequence,
    /// Distribution `q` the noise is drawn from.
    pub proposal: &'a GaussianSequence,
    pub scorer: &'a TrajectoryScorer,
}

impl Rollout<'_> {
    /// Resets `simulator` and feeds it `steps` noise vectors, stopping at the
    /// first collision.
    pub fn run<S, F>(
        &self,
        simulator: &mut S,
        generation: usize,
        member: usize,
        steps: usize,
        mut next_noise: F,
    ) -> StressResult<SimulationOutcome>
    where
        S: Simulator + ?Sized,
        F: FnMut(usize) -> Vec<f64>,
    {
        let horizon = self.target.len().min(self.proposal.len());
        if steps > horizon {
            return Err(StressError::DimensionMismatch {
                context: "rollout length",
                expected: horizon,
                actual: steps,
            });
        }
        let kind = self.schema.output_kind();
        simulator.reset();
        let mut records: Vec<StepRecord> = Vec::with_capacity(steps);
        let (mut cumulative_log_p, mut cumulative_log_q) = (0.0, 0.0);
        for step in 0..steps {
            let noise = next_noise(step);
            let log_p = self.target.step(step).log_prob(&noise)?;
            let log_q = self.proposal.step(step).log_prob(&noise)?;
            let outcome = simulator.step(&noise);
            if outcome.kind() != kind {
                return Err(StressError::OutputKindMismatch {
                    generation,
                    member,
                    step,
                });
            }
            let base = outcome.base();
            if base.state.len() != self.schema.state_dim {
                return Err(StressError::DimensionMismatch {
                    context: "simulator state",
                    expected: self.schema.state_dim,
                    actual: base.state.len(),
                });
            }
            cumulative_log_p += log_p;
            cumulative_log_q += log_q;
            let collided = base.collided;
            records.push(StepRecord {
                generation,
                member,
                step,
                noise,
                extension: outcome.extension(),
                risk: base.risk,
                state: base.state.clone(),
                log_p,
                log_q,
                cumulative_log_p,
                cumulative_log_q,
                collided,
                simulation_collided: false,
            });
            if collided {
                trace!(generation, member, step, "collision");
                break;
            }
        }
        Ok(finish(generation, member, records, self.scorer))
    }
}

/// Marks every record with the rollout's final collision flag and scores it.
pub fn finish(
    generation: usize,
    member: usize,
    mut records: Vec<StepRecord>,
    scorer: &TrajectoryScorer,
) -> SimulationOutcome {
    let collided = records.last().map(|r| r.collided).unwrap_or(false);
    for record in &mut records {
        record.simulation_collided = collided;
    }
    let (raw_score, score) = scorer.score(&records);
    let steps_to_collision = if collided {
        records.last().map(|r| r.step)
    } else {
        None
    };
    SimulationOutcome {
        generation,
        member,
        records,
        collided,
        raw_score,
        score,
        steps_to_collision,
    }
}

/// Evaluates generations against a pool of simulators.
///
/// Member `j` draws its noise from the `(generation, j)` sub-stream and runs
/// on simulator `j % pool.len()`, so results do not depend on scheduling.
pub struct PopulationEvaluator<'a> {
    rollout: Rollout<'a>,
    noise: NoiseSource,
    log: &'a TrajectoryLog,
}

impl<'a> PopulationEvaluator<'a> {
    pub fn new(rollout: Rollout<'a>, noise: NoiseSource, log: &'a TrajectoryLog) -> Self {
        Self {
            rollout,
            noise,
            log,
        }
    }

    /// Samples and runs one member without logging it.
    pub fn sample_member<S: Simulator + ?Sized>(
        &self,
        simulator: &mut S,
        generation: usize,
        member: usize,
    ) -> StressResult<SimulationOutcome> {
        let mut rng = self.noise.rollout_stream(generation, member);
        let proposal = self.rollout.proposal;
        self.rollout
            .run(simulator, generation, member, proposal.len(), |step| {
                proposal.sample_step(step, &mut rng)
            })
    }

    /// Runs `members` of `generation`, returning outcomes ordered by member.
    ///
    /// A fatal error in any member stops the remaining work and is returned;
    /// members already written to the log stay there.
    pub fn evaluate<S: Simulator>(
        &self,
        generation: usize,
        members: impl IntoIterator<Item = usize>,
        simulators: &mut [S],
        tracker: &mut dyn StressTracker,
    ) -> StressResult<Vec<SimulationOutcome>> {
        let workers = simulators.len();
        if workers == 0 {
            return Err(StressError::EmptySimulatorPool);
        }
        let tracker = Mutex::new(tracker);
        if workers == 1 {
            let simulator = &mut simulators[0];
            let mut population = members
                .into_iter()
                .map(|member| self.run_member(&mut *simulator, generation, member, &tracker))
                .collect::<StressResult<Vec<_>>>()?;
            population.sort_by_key(|outcome| outcome.member);
            return Ok(population);
        }

        let cancelled = AtomicBool::new(false);
        let members: Vec<usize> = members.into_iter().collect();
        let batches: Vec<StressResult<Vec<SimulationOutcome>>> = simulators
            .par_iter_mut()
            .enumerate()
            .map(|(worker, simulator)| {
                let mut outcomes = Vec::new();
                for &member in members.iter().filter(|m| *m % workers == worker) {
                    if cancelled.load(Ordering::Acquire) {
                        return Err(StressError::Cancelled);
                    }
                    match self.run_member(&mut *simulator, generation, member, &tracker) {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(err) => {
                            cancelled.store(true, Ordering::Release);
                            return Err(err);
                        }
                    }
                }
                Ok(outcomes)
            })
            .collect();

        let mut population = Vec::with_capacity(members.len());
        let mut failure = None;
        for batch in batches {
            match batch {
                Ok(outcomes) => population.extend(outcomes),
                Err(StressError::Cancelled) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        population.sort_by_key(|outcome| outcome.member);
        Ok(population)
    }

    fn run_member<S: Simulator + ?Sized>(
        &self,
        simulator: &mut S,
        generation: usize,
        member: usize,
        tracker: &Mutex<&mut dyn StressTracker>,
    ) -> StressResult<SimulationOutcome> {
        let outcome = self.sample_member(simulator, generation, member)?;
        self.log.append(&outcome)?;
        debug!(
            generation,
            member,
            steps = outcome.steps_executed(),
            collided = outcome.collided,
            score = outcome.score,
            "member evaluated"
        );
        let mut tracker = tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(step) = outcome.steps_to_collision {
            tracker.on_failure(FailureEvent {
                generation,
                member,
                step,
                records: &outcome.records,
            });
        }
        tracker.on_member_end(&outcome);
        Ok(outcome)
    }
}
