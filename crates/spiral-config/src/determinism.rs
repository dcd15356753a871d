// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::parse_flag;

/// Seeding and reduction-order policy for tensor kernels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// Whether unseeded random draws should derive from `base_seed`.
    pub enabled: bool,
    /// Base seed used to derive per-label seeds.
    pub base_seed: u64,
    /// Forces matrix kernels onto the calling thread.
    pub serial_reductions: bool,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: 42,
            serial_reductions: false,
        }
    }
}

impl DeterminismConfig {
    /// Reads `SPIRAL_DETERMINISTIC`, `SPIRAL_DETERMINISTIC_SEED` and
    /// `SPIRAL_DETERMINISTIC_REDUCTION`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = std::env::var("SPIRAL_DETERMINISTIC")
            .ok()
            .and_then(|v| parse_flag(&v))
            .unwrap_or(defaults.enabled);
        let base_seed = std::env::var("SPIRAL_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(defaults.base_seed);
        let serial_reductions = std::env::var("SPIRAL_DETERMINISTIC_REDUCTION")
            .ok()
            .and_then(|v| parse_flag(&v))
            .unwrap_or(enabled);
        Self {
            enabled,
            base_seed,
            serial_reductions,
        }
    }

    /// Derives a stable seed for the given label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the process configuration, reading the environment on first use.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Installs `cfg` unless a configuration was already observed.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

/// RNG seeded from `label` when determinism is enabled, from entropy otherwise.
pub fn rng_from_label(label: &str) -> StdRng {
    let cfg = config();
    if cfg.enabled {
        StdRng::seed_from_u64(cfg.seed_for(label))
    } else {
        StdRng::from_entropy()
    }
}

/// RNG seeded from an explicit seed, falling back to [`rng_from_label`].
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}

/// Whether matrix kernels must keep a fixed, single-threaded reduction order.
pub fn lock_reduction_order() -> bool {
    let cfg = config();
    cfg.enabled && cfg.serial_reductions
}
