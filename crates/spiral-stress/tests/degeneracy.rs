mod common;

use approx::assert_abs_diff_eq;
use common::{config, nominal, CumulativeSim};
use spiral_config::VarianceClamp;
use spiral_stress::{
    select_elites, CemEngine, EngineState, GaussianSequence, LogSchema, NoiseSource, Objective,
    PopulationEvaluator, Reweighter, Rollout, StepGaussian, TrajectoryLog, TrajectoryScorer,
};

#[test]
fn identical_target_and_proposal_weight_elites_uniformly() {
    let dir = tempfile::tempdir().unwrap();
    let target = nominal(5);
    let scorer = TrajectoryScorer::default();
    let mut pool = vec![CumulativeSim::new(10.0)];
    let schema = LogSchema::for_simulator(1, &pool[0]);
    let log = TrajectoryLog::open(dir.path().join("log.csv"), schema).unwrap();
    let rollout = Rollout {
        schema,
        target: &target,
        proposal: &target,
        scorer: &scorer,
    };
    let evaluator = PopulationEvaluator::new(rollout, NoiseSource::new(5), &log);
    let population = evaluator
        .evaluate(0, 0..12, &mut pool, &mut spiral_stress::NoOpTracker)
        .unwrap();
    let elites = select_elites(&population, 4, Objective::Minimize);
    let weights = Reweighter::new(1e-8).weights(0, &elites, 5);

    for step in &weights {
        assert!(!step.degenerate);
        assert_eq!(step.weights.len(), 4);
        for weight in &step.weights {
            assert_abs_diff_eq!(*weight, 0.25, epsilon = 1e-12);
        }
    }
}

#[test]
fn matching_step_is_weighted_uniformly_when_others_differ() {
    let dir = tempfile::tempdir().unwrap();
    let target = nominal(3);
    let proposal = GaussianSequence::new(vec![
        StepGaussian::diagonal(&[1.0], &[0.1]).unwrap(),
        StepGaussian::diagonal(&[0.0], &[1.0]).unwrap(),
        StepGaussian::diagonal(&[-0.5], &[0.3]).unwrap(),
    ])
    .unwrap();
    let scorer = TrajectoryScorer::default();
    let mut pool = vec![CumulativeSim::new(100.0)];
    let schema = LogSchema::for_simulator(1, &pool[0]);
    let log = TrajectoryLog::open(dir.path().join("log.csv"), schema).unwrap();
    let rollout = Rollout {
        schema,
        target: &target,
        proposal: &proposal,
        scorer: &scorer,
    };
    let evaluator = PopulationEvaluator::new(rollout, NoiseSource::new(11), &log);
    let population = evaluator
        .evaluate(0, 0..10, &mut pool, &mut spiral_stress::NoOpTracker)
        .unwrap();
    let elites = select_elites(&population, 4, Objective::Minimize);
    assert!(elites.iter().all(|elite| elite.steps_executed() == 3));
    let weights = Reweighter::new(1e-8).weights(0, &elites, 3);

    for weight in &weights[1].weights {
        assert_abs_diff_eq!(*weight, 0.25, epsilon = 1e-12);
    }
    for step in [0, 2] {
        let spread = weights[step]
            .weights
            .iter()
            .map(|w| (w - 0.25).abs())
            .fold(0.0, f64::max);
        assert!(spread > 1e-6, "step {step} should not be uniform");
    }
}

#[test]
fn identical_distributions_do_not_abort() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 12, 4, 1, 5);
    let mut engine =
        CemEngine::new(config, nominal(5), vec![CumulativeSim::new(10.0)]).unwrap();
    let report = engine.run().unwrap();
    assert_eq!(report.state, EngineState::Done);
    assert!(report.summaries[0].degenerate_steps.is_empty());
}

#[test]
fn collapsed_variance_aborts_with_the_last_valid_proposal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 6, 1, 3, 4);
    config.variance_clamp = VarianceClamp { min: 0.0, max: 0.1 };
    let mut engine =
        CemEngine::new(config, nominal(4), vec![CumulativeSim::new(10.0)]).unwrap();
    let report = engine.run().expect("a degenerate refit is not an error");

    match &report.state {
        EngineState::Aborted { generation, reason } => {
            assert_eq!(*generation, 0);
            assert!(reason.contains("positive definite"), "{reason}");
        }
        other => panic!("expected an aborted run, got {other:?}"),
    }
    assert_eq!(report.proposal.state(), nominal(4).state());
    assert_eq!(report.history.len(), 1);
    assert_eq!(report.summaries.len(), 1);
    assert!(report.best.is_none());
}
