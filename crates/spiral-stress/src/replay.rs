//! Re-runs logged collisions to check that they reproduce.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::distribution::GaussianSequence;
use crate::error::{StressError, StressResult};
use crate::evaluator::Rollout;
use crate::log::{group_by_member, LogSchema, TrajectoryLog};
use crate::scorer::TrajectoryScorer;
use crate::simulator::Simulator;
use crate::trajectory::{StepRecord, Trajectory};

/// Noise sequence of one logged rollout that ended in a collision.
#[derive(Debug, Clone, PartialEq)]
pub struct CollidedSequence {
    pub generation: usize,
    pub member: usize,
    pub collision_step: usize,
    pub noise: Trajectory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub confirmed: usize,
    pub not_reproduced: usize,
    /// `(generation, member)` of every sequence that did not collide again
    /// at the logged step.
    pub mismatches: Vec<(usize, usize)>,
}

/// Extracts the collided rollouts from parsed log rows, in log key order.
pub fn collided_sequences(records: Vec<StepRecord>) -> Vec<CollidedSequence> {
    group_by_member(records)
        .into_iter()
        .filter_map(|((generation, member), mut rows)| {
            rows.dedup_by_key(|record| record.step);
            let last = rows.last()?;
            if !last.simulation_collided {
                return None;
            }
            let collision_step = rows.iter().find(|record| record.collided)?.step;
            Some(CollidedSequence {
                generation,
                member,
                collision_step,
                noise: rows
                    .iter()
                    .take(collision_step + 1)
                    .map(|record| record.noise.clone())
                    .collect(),
            })
        })
        .collect()
}

/// Replays every collided sequence of `log_path` on `simulator`, appending
/// the replayed rows to `replay_log_path`.
///
/// Likelihood columns of the replay log are evaluated under `nominal` for
/// both `p` and `q`.
pub fn replay<S: Simulator + ?Sized>(
    log_path: &Path,
    replay_log_path: &Path,
    simulator: &mut S,
    nominal: &GaussianSequence,
    scorer: &TrajectoryScorer,
) -> StressResult<ReplayReport> {
    let (schema, records) = TrajectoryLog::read(log_path)?;
    let expected = LogSchema::for_simulator(schema.noise_dim, simulator);
    if expected != schema {
        return Err(StressError::ResumeMismatch(format!(
            "log layout {schema:?} does not match the replay simulator ({expected:?})"
        )));
    }
    let replay_log = TrajectoryLog::open(replay_log_path, schema)?;
    let rollout = Rollout {
        schema,
        target: nominal,
        proposal: nominal,
        scorer,
    };

    let mut report = ReplayReport::default();
    for sequence in collided_sequences(records) {
        let steps = sequence.noise.len();
        let outcome = rollout.run(
            simulator,
            sequence.generation,
            sequence.member,
            steps,
            |step| sequence.noise[step].clone(),
        )?;
        replay_log.append(&outcome)?;
        report.replayed += 1;
        if outcome.steps_to_collision == Some(sequence.collision_step) {
            report.confirmed += 1;
        } else {
            warn!(
                generation = sequence.generation,
                member = sequence.member,
                logged_step = sequence.collision_step,
                replayed_step = ?outcome.steps_to_collision,
                "collision not reproduced"
            );
            report.not_reproduced += 1;
            report
                .mismatches
                .push((sequence.generation, sequence.member));
        }
    }
    info!(
        replayed = report.replayed,
        confirmed = report.confirmed,
        not_reproduced = report.not_reproduced,
        "replay finished"
    );
    Ok(report)
}
