//! Snapshot written after every completed generation.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::distribution::SequenceState;
use crate::engine::{BestSolution, GenerationSummary, RunStats};
use crate::error::{StressError, StressResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// First generation that has not completed yet.
    pub next_generation: usize,
    pub seed: u64,
    /// Proposal that generation `next_generation` samples from.
    pub proposal: SequenceState,
    pub history: Vec<SequenceState>,
    pub summaries: Vec<GenerationSummary>,
    pub best: Option<BestSolution>,
    pub stats: RunStats,
}

impl Checkpoint {
    /// Writes through a temporary file so a crash never leaves a torn checkpoint.
    pub fn write(&self, path: &Path) -> StressResult<()> {
        let fail = |reason: String| StressError::Checkpoint {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| fail(e.to_string()))?;
        }
        let payload = serde_json::to_string_pretty(self).map_err(|e| fail(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| fail(e.to_string()))?;
        file.write_all(payload.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| fail(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| fail(e.to_string()))
    }

    pub fn read(path: &Path) -> StressResult<Self> {
        let fail = |reason: String| StressError::Checkpoint {
            path: path.to_path_buf(),
            reason,
        };
        let raw = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| fail(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::GaussianSequence;
    use spiral_config::NoiseModel;

    #[test]
    fn checkpoint_survives_a_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt").join("run.json");
        let sequence = GaussianSequence::from_noise_model(
            &NoiseModel {
                mean: vec![0.1, -1.0 / 3.0],
                std: vec![0.7, 1.3],
            },
            2,
        )
        .unwrap();
        let checkpoint = Checkpoint {
            next_generation: 3,
            seed: 99,
            proposal: sequence.state(),
            history: vec![sequence.state(), sequence.state()],
            summaries: Vec::new(),
            best: None,
            stats: RunStats::default(),
        };
        checkpoint.write(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(Checkpoint::read(&path).unwrap(), checkpoint);
    }

    #[test]
    fn missing_checkpoint_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        match Checkpoint::read(&path) {
            Err(StressError::Checkpoint { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected checkpoint error, got {other:?}"),
        }
    }
}
