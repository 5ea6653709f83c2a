//! Elite selection and self-normalized importance weights.

use spiral_config::Objective;
use tracing::warn;

use crate::trajectory::SimulationOutcome;

/// Picks the `count` most failure-indicating members.
///
/// Ranking is stable: ties keep member order, which is the order the
/// members were sampled in.
pub fn select_elites(
    population: &[SimulationOutcome],
    count: usize,
    objective: Objective,
) -> Vec<&SimulationOutcome> {
    let mut ranked: Vec<&SimulationOutcome> = population.iter().collect();
    ranked.sort_by(|a, b| {
        objective
            .ordering(a.score, b.score)
            .then(a.member.cmp(&b.member))
    });
    ranked.truncate(count.min(ranked.len()));
    ranked
}

/// `log(sum(exp(values)))`, ignoring non-finite entries.
///
/// Returns `-inf` when no entry is finite.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - max).exp())
        .sum();
    max + sum.ln()
}

/// Normalized weights for one timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct StepWeights {
    pub step: usize,
    /// Positions (into the elite slice) of the elites that reached `step`.
    pub contributors: Vec<usize>,
    pub weights: Vec<f64>,
    /// Every raw weight was zero or invalid; uniform weights were substituted.
    pub degenerate: bool,
}

impl StepWeights {
    pub fn is_empty(&self) -> bool {
        self.contributors.is_empty()
    }
}

/// Normalizes log-weights into weights summing to one.
///
/// Non-finite log-weights count as zero raw weight. Weights that underflow to
/// zero are raised to `floor` before a final renormalization. Returns the
/// weights and whether the uniform fallback was used.
pub fn normalize_log_weights(log_weights: &[f64], floor: f64) -> (Vec<f64>, bool) {
    let n = log_weights.len();
    if n == 0 {
        return (Vec::new(), false);
    }
    let total = log_sum_exp(log_weights);
    if !total.is_finite() {
        return (vec![1.0 / n as f64; n], true);
    }
    let mut weights: Vec<f64> = log_weights
        .iter()
        .map(|lw| if lw.is_finite() { (lw - total).exp() } else { 0.0 })
        .collect();
    if weights.iter().any(|w| *w <= 0.0) {
        for w in weights.iter_mut().filter(|w| **w <= 0.0) {
            *w = floor;
        }
        let sum: f64 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= sum);
    }
    (weights, false)
}

/// Computes per-step importance weights for the elite set.
#[derive(Debug, Clone, Copy)]
pub struct Reweighter {
    floor: f64,
}

impl Reweighter {
    pub fn new(floor: f64) -> Self {
        Self { floor }
    }

    /// Weights for every timestep `0..steps`.
    ///
    /// At step `i` an elite contributes `log w = log p_i(x_i) - log q_i(x_i)`,
    /// the likelihood ratio of its step-`i` noise alone. Elites truncated
    /// before `i` are left out of that step.
    pub fn weights(
        &self,
        generation: usize,
        elites: &[&SimulationOutcome],
        steps: usize,
    ) -> Vec<StepWeights> {
        let mut all = Vec::with_capacity(steps);
        for step in 0..steps {
            let mut contributors = Vec::new();
            let mut log_weights = Vec::new();
            for (position, elite) in elites.iter().enumerate() {
                if let Some(record) = elite.records.get(step) {
                    contributors.push(position);
                    log_weights.push(record.log_p - record.log_q);
                }
            }
            let (weights, degenerate) = normalize_log_weights(&log_weights, self.floor);
            if degenerate {
                warn!(
                    generation,
                    step,
                    elites = contributors.len(),
                    "all importance weights vanished; using uniform weights"
                );
            }
            all.push(StepWeights {
                step,
                contributors,
                weights,
                degenerate,
            });
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::StepGaussian;
    use crate::trajectory::StepRecord;
    use approx::assert_abs_diff_eq;

    fn outcome(member: usize, score: f64, ratios: &[(f64, f64)]) -> SimulationOutcome {
        let records = ratios
            .iter()
            .enumerate()
            .map(|(step, (p, q))| StepRecord {
                generation: 0,
                member,
                step,
                noise: vec![0.0],
                extension: None,
                risk: score,
                state: vec![],
                log_p: *p,
                log_q: *q,
                cumulative_log_p: 0.0,
                cumulative_log_q: 0.0,
                collided: false,
                simulation_collided: false,
            })
            .collect();
        SimulationOutcome {
            generation: 0,
            member,
            records,
            collided: false,
            raw_score: score,
            score,
            steps_to_collision: None,
        }
    }

    #[test]
    fn elites_are_ranked_stably_by_objective() {
        let population = vec![
            outcome(0, 0.5, &[]),
            outcome(1, 0.1, &[]),
            outcome(2, 0.1, &[]),
            outcome(3, 0.9, &[]),
        ];
        let min: Vec<usize> = select_elites(&population, 3, Objective::Minimize)
            .iter()
            .map(|o| o.member)
            .collect();
        assert_eq!(min, vec![1, 2, 0]);
        let max: Vec<usize> = select_elites(&population, 2, Objective::Maximize)
            .iter()
            .map(|o| o.member)
            .collect();
        assert_eq!(max, vec![3, 0]);
        assert_eq!(select_elites(&population, 10, Objective::Minimize).len(), 4);
    }

    #[test]
    fn log_sum_exp_is_stable_for_large_magnitudes() {
        assert_abs_diff_eq!(log_sum_exp(&[1000.0, 1000.0]), 1000.0 + 2f64.ln(), epsilon = 1e-9);
        assert_abs_diff_eq!(log_sum_exp(&[-1000.0, -1000.0]), -1000.0 + 2f64.ln(), epsilon = 1e-9);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, f64::NAN]), f64::NEG_INFINITY);
    }

    #[test]
    fn weights_sum_to_one_and_stay_positive() {
        let (weights, degenerate) = normalize_log_weights(&[0.0, -800.0, 2.0], 1e-8);
        assert!(!degenerate);
        assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(weights.iter().all(|w| *w > 0.0));
        assert!(weights[2] > weights[0]);
    }

    #[test]
    fn vanished_weights_fall_back_to_uniform() {
        let (weights, degenerate) =
            normalize_log_weights(&[f64::NEG_INFINITY, f64::NEG_INFINITY], 1e-8);
        assert!(degenerate);
        assert_eq!(weights, vec![0.5, 0.5]);
    }

    #[test]
    fn identical_target_and_proposal_give_uniform_weights() {
        let population = vec![
            outcome(0, 0.1, &[(-1.0, -1.0), (-2.0, -2.0)]),
            outcome(1, 0.2, &[(-3.0, -3.0), (-4.5, -4.5)]),
        ];
        let elites = select_elites(&population, 2, Objective::Minimize);
        let weights = Reweighter::new(1e-8).weights(0, &elites, 2);
        for step in &weights {
            assert!(!step.degenerate);
            for w in &step.weights {
                assert_abs_diff_eq!(*w, 0.5, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn step_weights_ignore_earlier_likelihood_ratios() {
        let p = StepGaussian::diagonal(&[0.0], &[1.0]).unwrap();
        let q0 = StepGaussian::diagonal(&[1.0], &[0.1]).unwrap();
        let ratios = |x0: f64, x1: f64| {
            [
                (p.log_prob(&[x0]).unwrap(), q0.log_prob(&[x0]).unwrap()),
                (p.log_prob(&[x1]).unwrap(), p.log_prob(&[x1]).unwrap()),
            ]
        };
        let population = vec![
            outcome(0, 0.1, &ratios(0.2, 0.5)),
            outcome(1, 0.2, &ratios(1.5, 0.5)),
        ];
        let elites = select_elites(&population, 2, Objective::Minimize);
        let weights = Reweighter::new(1e-8).weights(0, &elites, 2);
        assert!((weights[0].weights[0] - weights[0].weights[1]).abs() > 0.1);
        for w in &weights[1].weights {
            assert_abs_diff_eq!(*w, 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn truncated_elites_drop_out_of_later_steps() {
        let population = vec![
            outcome(0, 0.1, &[(-1.0, -1.0)]),
            outcome(1, 0.2, &[(-1.0, -2.0), (-2.0, -3.0), (-3.0, -4.0)]),
        ];
        let elites = select_elites(&population, 2, Objective::Minimize);
        let weights = Reweighter::new(1e-8).weights(0, &elites, 3);
        assert_eq!(weights[0].contributors, vec![0, 1]);
        assert_eq!(weights[1].contributors, vec![1]);
        assert_eq!(weights[1].weights, vec![1.0]);
        assert!(weights[0].weights[1] > weights[0].weights[0]);

        let lonely = vec![outcome(0, 0.1, &[(-1.0, -1.0)])];
        let elites = select_elites(&lonely, 1, Objective::Minimize);
        let weights = Reweighter::new(1e-8).weights(0, &elites, 2);
        assert!(weights[1].is_empty());
        assert!(!weights[1].degenerate);
    }
}
