use rand::{rngs::StdRng, RngCore, SeedableRng};

/// Process-level determinism switches read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// Whether deterministic execution is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive every rollout sub-stream.
    pub base_seed: u64,
    /// If true rollouts are evaluated sequentially regardless of the worker count.
    pub fix_reduction: bool,
}

impl DeterminismConfig {
    /// Builds a configuration snapshot from environment variables.
    pub fn from_env() -> Self {
        let enabled = std::env::var("SPIRAL_DETERMINISTIC")
            .ok()
            .map(|v| !matches!(v.as_str(), "0" | "false" | "False" | "off" | "OFF"))
            .unwrap_or(false);

        let base_seed = std::env::var("SPIRAL_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(42);

        let fix_reduction = std::env::var("SPIRAL_DETERMINISTIC_REDUCTION")
            .ok()
            .map(|v| matches!(v.as_str(), "1" | "true" | "True" | "on" | "ON"))
            .unwrap_or(false);

        Self {
            enabled,
            base_seed,
            fix_reduction,
        }
    }

    /// Picks the base seed for a run: an explicit seed always wins, then the
    /// deterministic environment seed, then operating-system entropy.
    pub fn resolve_seed(&self, explicit: Option<u64>) -> u64 {
        match explicit {
            Some(seed) => seed,
            None if self.enabled => self.base_seed,
            None => StdRng::from_entropy().next_u64(),
        }
    }

    /// Clamps a requested worker count to one when reductions must stay ordered.
    pub fn effective_workers(&self, requested: usize) -> usize {
        if self.fix_reduction {
            1
        } else {
            requested.max(1)
        }
    }
}

/// SplitMix64 finaliser. Stable across platforms and toolchains, unlike
/// `DefaultHasher`, so derived seeds survive a process restart.
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Derives the seed of the sub-stream addressed by `path` under `base_seed`.
pub fn stream_seed(base_seed: u64, path: &[u64]) -> u64 {
    path.iter()
        .fold(mix64(base_seed), |acc, &part| mix64(acc ^ mix64(part)))
}

/// Returns the RNG that owns the noise of one rollout.
pub fn rollout_rng(base_seed: u64, generation: usize, member: usize) -> StdRng {
    StdRng::seed_from_u64(stream_seed(base_seed, &[generation as u64, member as u64]))
}
