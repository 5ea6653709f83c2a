//! Generation loop of the cross-entropy method.
//!
//! Each generation samples a population from the current proposal, ranks
//! it, reweights the elites toward the target distribution and refits the
//! proposal. A refit that fails validation ends the run in
//! [`EngineState::Aborted`] with the last valid proposal.

use serde::{Deserialize, Serialize};
use spiral_config::{ConfigError, DeterminismConfig, RunConfig};
use tracing::{info, warn};

use crate::checkpoint::Checkpoint;
use crate::distribution::{GaussianSequence, NoiseSource, SequenceState};
use crate::error::{StressError, StressResult};
use crate::evaluator::{finish, PopulationEvaluator, Rollout};
use crate::log::{group_by_member, LogSchema, TrajectoryLog};
use crate::scorer::{RiskAdjustment, TrajectoryScorer};
use crate::simulator::Simulator;
use crate::tracker::{NoOpTracker, StressTracker};
use crate::trajectory::{SimulationOutcome, StepRecord};
use crate::updater::DistributionUpdater;
use crate::weights::{select_elites, Reweighter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum EngineState {
    Init,
    Running { generation: usize },
    Done,
    Aborted { generation: usize, reason: String },
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Done | EngineState::Aborted { .. })
    }
}

/// Counters accumulated over every simulation of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub simulations: usize,
    pub collisions: usize,
    /// Sum of the collision step over colliding simulations.
    pub steps_to_collision: usize,
}

impl RunStats {
    pub fn record(&mut self, outcome: &SimulationOutcome) {
        self.simulations += 1;
        if let Some(step) = outcome.steps_to_collision {
            self.collisions += 1;
            self.steps_to_collision += step;
        }
    }

    pub fn collision_rate(&self) -> f64 {
        if self.simulations == 0 {
            0.0
        } else {
            self.collisions as f64 / self.simulations as f64
        }
    }

    pub fn mean_steps_to_collision(&self) -> Option<f64> {
        (self.collisions > 0).then(|| self.steps_to_collision as f64 / self.collisions as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation: usize,
    pub simulations: usize,
    pub collisions: usize,
    pub mean_population_risk: f64,
    pub mean_elite_risk: f64,
    pub best_elite_risk: f64,
    /// Elite member indices in rank order.
    pub elite_members: Vec<usize>,
    /// Steps whose weights fell back to uniform.
    pub degenerate_steps: Vec<usize>,
}

/// Most failure-indicating elite seen so far and the proposal that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestSolution {
    pub generation: usize,
    pub member: usize,
    pub score: f64,
    pub distribution: SequenceState,
}

#[derive(Debug, Clone)]
pub struct CemReport {
    pub state: EngineState,
    pub seed: u64,
    /// Last valid proposal.
    pub proposal: GaussianSequence,
    /// Every proposal in order, starting with the target.
    pub history: Vec<GaussianSequence>,
    pub summaries: Vec<GenerationSummary>,
    pub best: Option<BestSolution>,
    pub stats: RunStats,
}

pub struct CemEngine<S: Simulator> {
    config: RunConfig,
    schema: LogSchema,
    target: GaussianSequence,
    proposal: GaussianSequence,
    history: Vec<GaussianSequence>,
    summaries: Vec<GenerationSummary>,
    best: Option<BestSolution>,
    stats: RunStats,
    simulators: Vec<S>,
    scorer: TrajectoryScorer,
    tracker: Box<dyn StressTracker>,
    noise: NoiseSource,
    state: EngineState,
    restored: bool,
}

impl<S: Simulator> CemEngine<S> {
    /// Validates `config` against the target distribution and simulator pool.
    ///
    /// The pool is shrunk to the effective worker count; every instance must
    /// report the same output kind and state dimension.
    pub fn new(
        config: RunConfig,
        target: GaussianSequence,
        mut simulators: Vec<S>,
    ) -> StressResult<Self> {
        config.validate()?;
        if target.len() != config.steps {
            return Err(StressError::DimensionMismatch {
                context: "target timesteps",
                expected: config.steps,
                actual: target.len(),
            });
        }
        if target.dim() != config.noise_dim {
            return Err(StressError::DimensionMismatch {
                context: "target noise",
                expected: config.noise_dim,
                actual: target.dim(),
            });
        }
        let first = simulators.first().ok_or(StressError::EmptySimulatorPool)?;
        let schema = LogSchema::for_simulator(config.noise_dim, first);
        for simulator in &simulators {
            if simulator.state_dim() != schema.state_dim {
                return Err(StressError::DimensionMismatch {
                    context: "simulator pool state",
                    expected: schema.state_dim,
                    actual: simulator.state_dim(),
                });
            }
            if simulator.output_kind() != schema.output_kind() {
                return Err(ConfigError::Invalid(
                    "simulator pool mixes output kinds".to_string(),
                )
                .into());
            }
        }

        let determinism = DeterminismConfig::from_env();
        let workers = determinism
            .effective_workers(config.workers)
            .min(simulators.len());
        simulators.truncate(workers);
        let seed = determinism.resolve_seed(config.seed);
        let scorer = TrajectoryScorer::new(config.risk_mode);

        Ok(Self {
            schema,
            proposal: target.clone(),
            history: vec![target.clone()],
            target,
            summaries: Vec::new(),
            best: None,
            stats: RunStats::default(),
            simulators,
            scorer,
            tracker: Box::new(NoOpTracker),
            noise: NoiseSource::new(seed),
            state: EngineState::Init,
            restored: false,
            config,
        })
    }

    /// Continues a run from an in-memory checkpoint.
    ///
    /// `config.resume.generation` must equal `checkpoint.next_generation`;
    /// members `0..config.resume.sample` of that generation, and any later
    /// member already complete in the log, are reloaded from the trajectory
    /// log instead of being simulated again.
    pub fn resume(
        config: RunConfig,
        target: GaussianSequence,
        simulators: Vec<S>,
        checkpoint: Checkpoint,
    ) -> StressResult<Self> {
        let mut engine = Self::new(config, target, simulators)?;
        engine.check_checkpoint(&checkpoint)?;
        engine.apply_checkpoint(checkpoint)?;
        Ok(engine)
    }

    pub fn with_adjustment(mut self, adjustment: impl RiskAdjustment + 'static) -> Self {
        self.scorer = self.scorer.with_adjustment(adjustment);
        self
    }

    pub fn with_tracker(mut self, tracker: Box<dyn StressTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.noise.base_seed()
    }

    pub fn workers(&self) -> usize {
        self.simulators.len()
    }

    pub fn proposal(&self) -> &GaussianSequence {
        &self.proposal
    }

    pub fn history(&self) -> &[GaussianSequence] {
        &self.history
    }

    pub fn summaries(&self) -> &[GenerationSummary] {
        &self.summaries
    }

    pub fn best(&self) -> Option<&BestSolution> {
        self.best.as_ref()
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn report(&self) -> CemReport {
        CemReport {
            state: self.state.clone(),
            seed: self.seed(),
            proposal: self.proposal.clone(),
            history: self.history.clone(),
            summaries: self.summaries.clone(),
            best: self.best.clone(),
            stats: self.stats,
        }
    }

    pub fn checkpoint(&self, next_generation: usize) -> Checkpoint {
        Checkpoint {
            next_generation,
            seed: self.seed(),
            proposal: self.proposal.state(),
            history: self.history.iter().map(GaussianSequence::state).collect(),
            summaries: self.summaries.clone(),
            best: self.best.clone(),
            stats: self.stats,
        }
    }

    /// Runs every remaining generation.
    ///
    /// Fatal errors (log I/O, simulator contract violations, checkpoint
    /// failures) are returned; a degenerate refit is not an error.
    pub fn run(&mut self) -> StressResult<CemReport> {
        if self.state.is_terminal() {
            return Ok(self.report());
        }
        let resume = self.config.resume;
        let restored = if resume.is_fresh() || self.restored {
            Ok(())
        } else {
            self.restore()
        };
        let opened =
            restored.and_then(|()| TrajectoryLog::open(&self.config.log_path, self.schema));
        let log = match opened {
            Ok(log) => log,
            Err(err) => {
                self.state = EngineState::Aborted {
                    generation: resume.generation,
                    reason: err.to_string(),
                };
                return Err(err);
            }
        };
        info!(
            seed = self.seed(),
            workers = self.workers(),
            generations = self.config.generations,
            population = self.config.population,
            start_generation = resume.generation,
            start_sample = resume.sample,
            "starting cross-entropy run"
        );

        for generation in resume.generation..self.config.generations {
            self.state = EngineState::Running { generation };
            let restart = (generation == resume.generation && !resume.is_fresh())
                .then_some(resume.sample);
            let result = self.run_generation(&log, generation, restart);
            match result {
                Ok(true) => {}
                Ok(false) => return Ok(self.report()),
                Err(err) => {
                    self.state = EngineState::Aborted {
                        generation,
                        reason: err.to_string(),
                    };
                    return Err(err);
                }
            }
        }
        self.state = EngineState::Done;
        info!(
            simulations = self.stats.simulations,
            collisions = self.stats.collisions,
            "cross-entropy run finished"
        );
        Ok(self.report())
    }

    /// Returns `Ok(false)` when the refit was degenerate and the run aborted.
    ///
    /// `restart` is the resume sample when this generation was interrupted:
    /// members already complete in the log are reloaded, never resimulated.
    fn run_generation(
        &mut self,
        log: &TrajectoryLog,
        generation: usize,
        restart: Option<usize>,
    ) -> StressResult<bool> {
        let mut population = match restart {
            Some(sample) => self.reload_members(generation, sample)?,
            None => Vec::with_capacity(self.config.population),
        };
        let pending: Vec<usize> = (0..self.config.population)
            .filter(|member| population.iter().all(|outcome| outcome.member != *member))
            .collect();
        let evaluated = {
            let rollout = Rollout {
                schema: self.schema,
                target: &self.target,
                proposal: &self.proposal,
                scorer: &self.scorer,
            };
            let evaluator = PopulationEvaluator::new(rollout, self.noise, log);
            evaluator.evaluate(
                generation,
                pending,
                &mut self.simulators,
                self.tracker.as_mut(),
            )?
        };
        population.extend(evaluated);
        population.sort_by_key(|outcome| outcome.member);
        for outcome in &population {
            self.stats.record(outcome);
        }

        let elites = select_elites(&population, self.config.elite, self.config.objective);
        let weights = Reweighter::new(self.config.weight_floor).weights(
            generation,
            &elites,
            self.config.steps,
        );
        let summary = summarize(generation, &population, &elites, &weights);
        info!(
            generation,
            collisions = summary.collisions,
            mean_risk = summary.mean_population_risk,
            elite_risk = summary.mean_elite_risk,
            best_risk = summary.best_elite_risk,
            degenerate_steps = summary.degenerate_steps.len(),
            "generation complete"
        );

        let updater = DistributionUpdater::new(self.config.variance_clamp);
        let refit = updater.refit(&self.proposal, &elites, &weights);
        self.summaries.push(summary);
        if let Some(summary) = self.summaries.last() {
            self.tracker.on_generation_end(summary);
        }
        match refit {
            Ok(next) => {
                self.proposal = next;
                self.history.push(self.proposal.clone());
                if let Some(top) = elites.first() {
                    self.record_best(generation, top);
                }
            }
            Err(err) if err.is_degenerate() => {
                warn!(generation, error = %err, "proposal refit is degenerate; aborting run");
                self.state = EngineState::Aborted {
                    generation,
                    reason: err.to_string(),
                };
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        if let Some(path) = self.config.checkpoint_path.clone() {
            let checkpoint = self.checkpoint(generation + 1);
            checkpoint.write(&path)?;
            self.tracker.on_checkpoint(&checkpoint);
        }
        Ok(true)
    }

    fn record_best(&mut self, generation: usize, top: &SimulationOutcome) {
        let objective = self.config.objective;
        let improves = self
            .best
            .as_ref()
            .map_or(true, |best| objective.prefers(top.score, best.score));
        if improves {
            self.best = Some(BestSolution {
                generation,
                member: top.member,
                score: top.score,
                distribution: self.proposal.state(),
            });
        }
    }

    fn restore(&mut self) -> StressResult<()> {
        let resume = self.config.resume;
        if resume.generation == 0 {
            return match self.config.seed {
                Some(_) => Ok(()),
                None if DeterminismConfig::from_env().enabled => Ok(()),
                None => Err(StressError::ResumeMismatch(
                    "resuming generation 0 requires a fixed seed".to_string(),
                )),
            };
        }
        let path = self.config.checkpoint_path.clone().ok_or_else(|| {
            StressError::ResumeMismatch("resuming requires a checkpoint path".to_string())
        })?;
        let checkpoint = Checkpoint::read(&path)?;
        self.check_checkpoint(&checkpoint)?;
        self.apply_checkpoint(checkpoint)?;
        info!(
            generation = resume.generation,
            path = %path.display(),
            "restored checkpoint"
        );
        Ok(())
    }

    fn check_checkpoint(&self, checkpoint: &Checkpoint) -> StressResult<()> {
        let resume = self.config.resume;
        if checkpoint.next_generation != resume.generation {
            return Err(StressError::ResumeMismatch(format!(
                "checkpoint continues at generation {}, configuration asks for {}",
                checkpoint.next_generation, resume.generation
            )));
        }
        if let Some(seed) = self.config.seed.filter(|seed| *seed != checkpoint.seed) {
            return Err(StressError::ResumeMismatch(format!(
                "checkpoint was written with seed {}, configuration uses {seed}",
                checkpoint.seed
            )));
        }
        Ok(())
    }

    fn apply_checkpoint(&mut self, checkpoint: Checkpoint) -> StressResult<()> {
        let proposal = GaussianSequence::from_state(&checkpoint.proposal)?;
        if proposal.len() != self.config.steps || proposal.dim() != self.config.noise_dim {
            return Err(StressError::ResumeMismatch(format!(
                "checkpoint proposal is {}x{}, configuration expects {}x{}",
                proposal.len(),
                proposal.dim(),
                self.config.steps,
                self.config.noise_dim
            )));
        }
        self.history = checkpoint
            .history
            .iter()
            .map(GaussianSequence::from_state)
            .collect::<StressResult<Vec<_>>>()?;
        self.proposal = proposal;
        self.summaries = checkpoint.summaries;
        self.best = checkpoint.best;
        self.stats = checkpoint.stats;
        self.noise = NoiseSource::new(checkpoint.seed);
        self.restored = true;
        Ok(())
    }

    /// Rebuilds the logged members of an interrupted `generation`.
    ///
    /// Members `0..required` must be complete in the log. Later members are
    /// reloaded when complete, since a parallel run may have finished them
    /// before it stopped; partially written ones are left to be resimulated.
    fn reload_members(
        &self,
        generation: usize,
        required: usize,
    ) -> StressResult<Vec<SimulationOutcome>> {
        let (schema, records) = TrajectoryLog::read(&self.config.log_path)?;
        if schema != self.schema {
            return Err(StressError::ResumeMismatch(format!(
                "log layout {schema:?} does not match the simulator ({:?})",
                self.schema
            )));
        }
        let population = self.config.population;
        let grouped = group_by_member(
            records
                .into_iter()
                .filter(|record| record.generation == generation && record.member < population)
                .collect(),
        );
        let mut reloaded = Vec::with_capacity(grouped.len());
        for ((_, member), mut rows) in grouped {
            rows.dedup_by_key(|record| record.step);
            if is_complete(&rows, self.config.steps) {
                reloaded.push(finish(generation, member, rows, &self.scorer));
            } else if member < required {
                return Err(StressError::ResumeMismatch(format!(
                    "member {member} of generation {generation} is incomplete in the log"
                )));
            }
        }
        if let Some(missing) =
            (0..required).find(|member| reloaded.iter().all(|outcome| outcome.member != *member))
        {
            return Err(StressError::ResumeMismatch(format!(
                "member {missing} of generation {generation} is missing from the log"
            )));
        }
        Ok(reloaded)
    }
}

/// A logged rollout is complete when its steps are contiguous from zero and it
/// either ran the full horizon or ended in a collision.
fn is_complete(rows: &[StepRecord], steps: usize) -> bool {
    let contiguous = rows.iter().enumerate().all(|(index, row)| row.step == index);
    contiguous
        && rows
            .last()
            .map_or(false, |last| last.collided || rows.len() == steps)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

fn summarize(
    generation: usize,
    population: &[SimulationOutcome],
    elites: &[&SimulationOutcome],
    weights: &[crate::weights::StepWeights],
) -> GenerationSummary {
    GenerationSummary {
        generation,
        simulations: population.len(),
        collisions: population.iter().filter(|o| o.collided).count(),
        mean_population_risk: mean(population.iter().map(|o| o.score)),
        mean_elite_risk: mean(elites.iter().map(|o| o.score)),
        best_elite_risk: elites.first().map(|o| o.score).unwrap_or(f64::NAN),
        elite_members: elites.iter().map(|o| o.member).collect(),
        degenerate_steps: weights
            .iter()
            .filter(|w| w.degenerate)
            .map(|w| w.step)
            .collect(),
    }
}
