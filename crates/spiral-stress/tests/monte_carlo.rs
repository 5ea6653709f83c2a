mod common;

use common::{nominal, AlwaysCollide, CumulativeSim};
use spiral_stress::{
    FailureCollector, MonteCarloConfig, MonteCarloEstimator, StressError, TrajectoryLog,
};

#[test]
fn always_colliding_simulator_fails_every_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MonteCarloConfig::new(25, 4, 1, dir.path().join("mc.csv"));
    config.seed = Some(3);
    let failures = FailureCollector::new();
    let mut estimator = MonteCarloEstimator::new(config, nominal(4), vec![AlwaysCollide])
        .unwrap()
        .with_tracker(Box::new(failures.clone()));
    let report = estimator.run().unwrap();

    assert_eq!(report.simulations, 25);
    assert_eq!(report.failures, 25);
    assert_eq!(report.failure_probability, 1.0);
    assert_eq!(report.standard_error, 0.0);
    assert_eq!(report.stats.mean_steps_to_collision(), Some(0.0));
    assert_eq!(failures.failures().len(), 25);

    let (_, records) = TrajectoryLog::read(dir.path().join("mc.csv")).unwrap();
    assert_eq!(records.len(), 25);
    assert!(records.iter().all(|r| r.step == 0 && r.collided && r.log_p == r.log_q));
}

#[test]
fn start_iter_skips_already_logged_simulations() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MonteCarloConfig::new(10, 3, 1, dir.path().join("mc.csv"));
    config.seed = Some(3);
    config.start_iter = 4;
    let report = MonteCarloEstimator::new(config, nominal(3), vec![CumulativeSim::new(100.0)])
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(report.simulations, 6);
    assert_eq!(report.failures, 0);

    let (_, records) = TrajectoryLog::read(dir.path().join("mc.csv")).unwrap();
    assert_eq!(records.len(), 18);
    assert_eq!(records.iter().map(|r| r.member).min(), Some(4));
}

#[test]
fn mismatched_nominal_distribution_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = MonteCarloConfig::new(10, 3, 1, dir.path().join("mc.csv"));
    assert!(matches!(
        MonteCarloEstimator::new(config, nominal(5), vec![AlwaysCollide]),
        Err(StressError::DimensionMismatch { .. })
    ));
}
