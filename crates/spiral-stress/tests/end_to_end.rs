mod common;

use approx::assert_abs_diff_eq;
use common::{config, nominal, CumulativeSim, ExtendedSim};
use spiral_stress::{
    CemEngine, EngineState, FailureCollector, LogSchema, OutputKind, StressError, TrajectoryLog,
};

#[test]
fn single_generation_shifts_the_proposal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 6, 2, 1, 3);
    let log_path = config.log_path.clone();
    let failures = FailureCollector::new();
    let mut engine = CemEngine::new(config, nominal(3), vec![CumulativeSim::new(2.0)])
        .unwrap()
        .with_tracker(Box::new(failures.clone()));

    let report = engine.run().expect("run completes");
    assert_eq!(report.state, EngineState::Done);
    assert_eq!(report.history.len(), 2);
    assert_eq!(report.summaries.len(), 1);
    assert!(report.best.is_some());
    assert_eq!(report.summaries[0].elite_members.len(), 2);
    // Refitted steps are clamped; steps no elite reached keep the nominal variance.
    for variances in report.proposal.variances() {
        assert!(variances
            .iter()
            .all(|v| (1e-6..=0.1).contains(v) || *v == 1.0));
    }

    let (schema, records) = TrajectoryLog::read(&log_path).unwrap();
    assert_eq!(schema, LogSchema::new(1, 1, OutputKind::Base));
    let members: std::collections::BTreeSet<usize> =
        records.iter().map(|record| record.member).collect();
    assert_eq!(members.len(), 6);
    assert!(records.iter().all(|record| record.step < 3));
    for record in &records {
        // Generation 0 samples from the target itself.
        assert_eq!(record.log_p, record.log_q);
        assert_eq!(record.cumulative_log_p, record.cumulative_log_q);
    }

    let collided = records
        .iter()
        .filter(|record| record.collided)
        .count();
    assert_eq!(collided, report.stats.collisions);
    assert_eq!(failures.failures().len(), report.stats.collisions);

    // With p == q every elite that reached a step carries equal weight, so the
    // refit mean is the plain average of their noise at that step.
    let elites = &report.summaries[0].elite_members;
    let refit = report.proposal.means();
    for step in 0..3 {
        let reached: Vec<f64> = records
            .iter()
            .filter(|record| record.step == step && elites.contains(&record.member))
            .map(|record| record.noise[0])
            .collect();
        let expected = if reached.is_empty() {
            0.0
        } else {
            reached.iter().sum::<f64>() / reached.len() as f64
        };
        assert_abs_diff_eq!(refit[step][0], expected, epsilon = 1e-9);
    }
}

#[test]
fn rollouts_stop_at_the_first_collision() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 20, 4, 2, 6);
    let log_path = config.log_path.clone();
    let mut engine =
        CemEngine::new(config, nominal(6), vec![CumulativeSim::new(0.5)]).unwrap();
    let report = engine.run().unwrap();
    assert!(report.stats.collisions > 0);

    let (_, records) = TrajectoryLog::read(&log_path).unwrap();
    let grouped = spiral_stress::log::group_by_member(records);
    for rows in grouped.values() {
        let collisions = rows.iter().filter(|row| row.collided).count();
        assert!(collisions <= 1);
        if collisions == 1 {
            assert!(rows.last().unwrap().collided);
            assert!(rows.iter().all(|row| row.simulation_collided));
        } else {
            assert_eq!(rows.len(), 6);
            assert!(rows.iter().all(|row| !row.simulation_collided));
        }
    }
}

#[test]
fn later_generations_carry_likelihood_ratios() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 10, 3, 3, 4);
    let log_path = config.log_path.clone();
    let mut engine =
        CemEngine::new(config, nominal(4), vec![CumulativeSim::new(3.0)]).unwrap();
    let report = engine.run().unwrap();
    assert_eq!(report.state, EngineState::Done);
    assert_eq!(report.history.len(), 4);

    let (_, records) = TrajectoryLog::read(&log_path).unwrap();
    assert!(records
        .iter()
        .filter(|record| record.generation > 0)
        .any(|record| record.log_p != record.log_q));
    let best = report.best.unwrap();
    assert!(best.generation < 3);
    assert_eq!(best.distribution.steps.len(), 4);
}

#[test]
fn extended_simulators_log_reward_columns() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 6, 2, 1, 3);
    let log_path = config.log_path.clone();
    let mut engine = CemEngine::new(config, nominal(3), vec![ExtendedSim::new(2.0)]).unwrap();
    engine.run().unwrap();

    let header = std::fs::read_to_string(&log_path)
        .unwrap()
        .lines()
        .next()
        .unwrap()
        .to_string();
    assert_eq!(
        header,
        "generation,member,step,noise_0,reward,uncertainty,risk,state_0,log_p,log_q,\
         cumulative_log_p,cumulative_log_q,collided,simulation_collided"
    );
    let (schema, records) = TrajectoryLog::read(&log_path).unwrap();
    assert!(schema.extended);
    assert!(records.iter().all(|record| record.extension.is_some()));
}

#[test]
fn reward_adjustment_changes_ranking_scores() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 6, 2, 1, 3);
    let mut engine = CemEngine::new(config, nominal(3), vec![ExtendedSim::new(2.0)])
        .unwrap()
        .with_adjustment(spiral_stress::RewardScaled { factor: 1.0 });
    let report = engine.run().unwrap();
    assert_eq!(report.state, EngineState::Done);
}

#[test]
fn changing_output_kind_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 4, 2, 1, 3);
    let mut engine =
        CemEngine::new(config, nominal(3), vec![common::FlakySim::new(2.0, 1)]).unwrap();
    match engine.run() {
        Err(StressError::OutputKindMismatch {
            generation: 0,
            member: 1,
            step: 0,
        }) => {}
        other => panic!("expected output kind mismatch, got {other:?}"),
    }
    assert!(matches!(
        engine.state(),
        EngineState::Aborted { generation: 0, .. }
    ));
}
