//! Contract consumed from the dynamics/rendering simulator, plus a small
//! reference simulator used by the CLI and the test-suite.

use serde::{Deserialize, Serialize};

/// Which step variant a simulator produces. Fixed per simulator for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Base,
    Extended,
}

/// Fields every simulator reports after a step.
#[derive(Clone, Debug, PartialEq)]
pub struct BaseStep {
    pub collided: bool,
    pub risk: f64,
    pub state: Vec<f64>,
}

/// Extra terms reported by simulators that estimate their own uncertainty.
///
/// Any auxiliary trace the simulator keeps is folded into `reward` on its side.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepExtension {
    pub reward: f64,
    pub uncertainty: f64,
}

/// Result of advancing a simulator by one noise vector.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    Base(BaseStep),
    Extended {
        base: BaseStep,
        extension: StepExtension,
    },
}

impl StepOutcome {
    pub fn kind(&self) -> OutputKind {
        match self {
            StepOutcome::Base(_) => OutputKind::Base,
            StepOutcome::Extended { .. } => OutputKind::Extended,
        }
    }

    pub fn base(&self) -> &BaseStep {
        match self {
            StepOutcome::Base(base) | StepOutcome::Extended { base, .. } => base,
        }
    }

    pub fn extension(&self) -> Option<StepExtension> {
        match self {
            StepOutcome::Base(_) => None,
            StepOutcome::Extended { extension, .. } => Some(*extension),
        }
    }
}

/// Closed-loop system under test.
///
/// An instance is owned by exactly one rollout between `reset` and the end of
/// that rollout, and must not carry state across `reset` calls.
pub trait Simulator: Send {
    /// Variant returned by every call to [`Simulator::step`].
    fn output_kind(&self) -> OutputKind {
        OutputKind::Base
    }

    /// Length of the state vector reported in [`BaseStep::state`].
    fn state_dim(&self) -> usize;

    fn reset(&mut self);

    fn step(&mut self, noise: &[f64]) -> StepOutcome;
}

impl<S: Simulator + ?Sized> Simulator for Box<S> {
    fn output_kind(&self) -> OutputKind {
        (**self).output_kind()
    }

    fn state_dim(&self) -> usize {
        (**self).state_dim()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn step(&mut self, noise: &[f64]) -> StepOutcome {
        (**self).step(noise)
    }
}

/// Point agent that integrates the disturbance directly into its position.
///
/// Risk is the negated distance to `goal`; the agent collides once it leaves
/// the ball of radius `collision_threshold` around the origin.
#[derive(Clone, Debug)]
pub struct ToySimulator {
    position: Vec<f64>,
    goal: Vec<f64>,
    collision_threshold: f64,
}

impl ToySimulator {
    pub fn new(goal: Vec<f64>, collision_threshold: f64) -> Self {
        Self {
            position: vec![0.0; goal.len()],
            goal,
            collision_threshold,
        }
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }
}

impl Simulator for ToySimulator {
    fn state_dim(&self) -> usize {
        self.goal.len()
    }

    fn reset(&mut self) {
        self.position.iter_mut().for_each(|p| *p = 0.0);
    }

    fn step(&mut self, noise: &[f64]) -> StepOutcome {
        for (p, n) in self.position.iter_mut().zip(noise) {
            *p += n;
        }
        let to_goal = self
            .position
            .iter()
            .zip(&self.goal)
            .map(|(p, g)| (p - g).powi(2))
            .sum::<f64>()
            .sqrt();
        let radius = self.position.iter().map(|p| p * p).sum::<f64>().sqrt();
        StepOutcome::Base(BaseStep {
            collided: radius > self.collision_threshold,
            risk: -to_goal,
            state: self.position.clone(),
        })
    }
}
