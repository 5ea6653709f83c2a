mod common;

use common::{nominal, CumulativeSim};
use spiral_stress::{replay, MonteCarloConfig, MonteCarloEstimator, TrajectoryLog, TrajectoryScorer};

fn collided_log(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("mc.csv");
    let mut config = MonteCarloConfig::new(20, 5, 1, &path);
    config.seed = Some(17);
    let report = MonteCarloEstimator::new(config, nominal(5), vec![CumulativeSim::new(0.5)])
        .unwrap()
        .run()
        .unwrap();
    assert!(report.failures > 0, "fixture needs at least one collision");
    path
}

#[test]
fn replay_on_the_same_simulator_confirms_every_collision() {
    let dir = tempfile::tempdir().unwrap();
    let log = collided_log(dir.path());
    let replay_log = dir.path().join("replay.csv");
    let mut simulator = CumulativeSim::new(0.5);
    let report = replay(
        &log,
        &replay_log,
        &mut simulator,
        &nominal(5),
        &TrajectoryScorer::default(),
    )
    .unwrap();

    assert!(report.replayed > 0);
    assert_eq!(report.confirmed, report.replayed);
    assert_eq!(report.not_reproduced, 0);

    let (_, original) = TrajectoryLog::read(&log).unwrap();
    let (_, replayed) = TrajectoryLog::read(&replay_log).unwrap();
    let collided_rows: Vec<_> = original
        .into_iter()
        .filter(|r| r.simulation_collided)
        .collect();
    assert_eq!(replayed, collided_rows);
}

#[test]
fn replay_on_a_safer_simulator_reports_mismatches() {
    let dir = tempfile::tempdir().unwrap();
    let log = collided_log(dir.path());
    let mut simulator = CumulativeSim::new(1e6);
    let report = replay(
        &log,
        &dir.path().join("replay.csv"),
        &mut simulator,
        &nominal(5),
        &TrajectoryScorer::default(),
    )
    .unwrap();
    assert_eq!(report.confirmed, 0);
    assert_eq!(report.not_reproduced, report.replayed);
    assert_eq!(report.mismatches.len(), report.replayed);
}
