#![allow(dead_code)]

use std::path::Path;

use spiral_stress::{
    BaseStep, GaussianSequence, NoiseModel, OutputKind, RunConfig, Simulator, StepExtension,
    StepOutcome,
};

/// Scalar random walk that collides once its position exceeds `threshold`.
/// Risk is the remaining distance to the threshold.
#[derive(Clone, Debug)]
pub struct CumulativeSim {
    pub threshold: f64,
    position: f64,
}

impl CumulativeSim {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            position: 0.0,
        }
    }

    fn advance(&mut self, noise: &[f64]) -> BaseStep {
        self.position += noise[0];
        BaseStep {
            collided: self.position > self.threshold,
            risk: self.threshold - self.position,
            state: vec![self.position],
        }
    }
}

impl Simulator for CumulativeSim {
    fn state_dim(&self) -> usize {
        1
    }

    fn reset(&mut self) {
        self.position = 0.0;
    }

    fn step(&mut self, noise: &[f64]) -> StepOutcome {
        StepOutcome::Base(self.advance(noise))
    }
}

/// Same walk, reporting a reward and an uncertainty with every step.
#[derive(Clone, Debug)]
pub struct ExtendedSim {
    inner: CumulativeSim,
}

impl ExtendedSim {
    pub fn new(threshold: f64) -> Self {
        Self {
            inner: CumulativeSim::new(threshold),
        }
    }
}

impl Simulator for ExtendedSim {
    fn output_kind(&self) -> OutputKind {
        OutputKind::Extended
    }

    fn state_dim(&self) -> usize {
        1
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn step(&mut self, noise: &[f64]) -> StepOutcome {
        let base = self.inner.advance(noise);
        StepOutcome::Extended {
            extension: StepExtension {
                reward: -base.risk.abs(),
                uncertainty: noise[0].abs(),
            },
            base,
        }
    }
}

/// Collides on the very first step.
#[derive(Clone, Debug, Default)]
pub struct AlwaysCollide;

impl Simulator for AlwaysCollide {
    fn state_dim(&self) -> usize {
        0
    }

    fn reset(&mut self) {}

    fn step(&mut self, _noise: &[f64]) -> StepOutcome {
        StepOutcome::Base(BaseStep {
            collided: true,
            risk: 0.0,
            state: Vec::new(),
        })
    }
}

/// Breaks the declared output contract on the `fail_at`-th rollout (0-based).
#[derive(Clone, Debug)]
pub struct FlakySim {
    inner: CumulativeSim,
    rollouts: usize,
    fail_at: usize,
}

impl FlakySim {
    pub fn new(threshold: f64, fail_at: usize) -> Self {
        Self {
            inner: CumulativeSim::new(threshold),
            rollouts: 0,
            fail_at,
        }
    }
}

impl Simulator for FlakySim {
    fn state_dim(&self) -> usize {
        1
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.rollouts += 1;
    }

    fn step(&mut self, noise: &[f64]) -> StepOutcome {
        let base = self.inner.advance(noise);
        if self.rollouts == self.fail_at + 1 {
            StepOutcome::Extended {
                base,
                extension: StepExtension {
                    reward: 0.0,
                    uncertainty: 0.0,
                },
            }
        } else {
            StepOutcome::Base(base)
        }
    }
}

pub fn nominal(steps: usize) -> GaussianSequence {
    GaussianSequence::from_noise_model(&NoiseModel::isotropic(1, 0.0, 1.0), steps)
        .expect("standard normal is a valid distribution")
}

pub fn config(
    dir: &Path,
    population: usize,
    elite: usize,
    generations: usize,
    steps: usize,
) -> RunConfig {
    let mut config = RunConfig::new(population, elite, generations, steps, 1, dir.join("log.csv"));
    config.seed = Some(2024);
    config
}
