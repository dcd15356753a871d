// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Defaults for curvature-matrix estimation.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::parse_flag;

/// Solver used to diagonalise a materialised curvature matrix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EigenRoute {
    /// Symmetric eigendecomposition.
    #[default]
    Symmetric,
    /// Singular value decomposition; singular vectors double as eigenvectors
    /// for a PSD matrix.
    Svd,
}

impl EigenRoute {
    pub fn as_str(self) -> &'static str {
        match self {
            EigenRoute::Symmetric => "symeig",
            EigenRoute::Svd => "svd",
        }
    }
}

impl fmt::Display for EigenRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EigenRoute {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "symeig" | "eigh" | "symmetric" => Ok(EigenRoute::Symmetric),
            "svd" => Ok(EigenRoute::Svd),
            other => Err(format!("unknown eigen route '{other}'")),
        }
    }
}

/// Knobs shared by every curvature generator.
#[derive(Clone, Debug, PartialEq)]
pub struct CurvatureConfig {
    /// Route used when a cached eigendecomposition is requested implicitly.
    pub eigen_route: EigenRoute,
    /// Relative threshold under which low-rank eigenpairs are discarded.
    pub eigen_cutoff: f64,
    /// Drop outer-batch captures as soon as their inner sweep completes.
    pub evict_outer: bool,
}

impl Default for CurvatureConfig {
    fn default() -> Self {
        Self {
            eigen_route: EigenRoute::Symmetric,
            eigen_cutoff: 1e-12,
            evict_outer: true,
        }
    }
}

impl CurvatureConfig {
    /// Reads `SPIRAL_CURVATURE_EIGEN`, `SPIRAL_CURVATURE_EIGEN_CUTOFF` and
    /// `SPIRAL_CURVATURE_EVICT_OUTER`. Unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let eigen_route = std::env::var("SPIRAL_CURVATURE_EIGEN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.eigen_route);
        let eigen_cutoff = std::env::var("SPIRAL_CURVATURE_EIGEN_CUTOFF")
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(defaults.eigen_cutoff);
        let evict_outer = std::env::var("SPIRAL_CURVATURE_EVICT_OUTER")
            .ok()
            .and_then(|v| parse_flag(&v))
            .unwrap_or(defaults.evict_outer);
        Self {
            eigen_route,
            eigen_cutoff,
            evict_outer,
        }
    }

    pub fn with_eigen_route(mut self, route: EigenRoute) -> Self {
        self.eigen_route = route;
        self
    }

    pub fn with_eigen_cutoff(mut self, cutoff: f64) -> Self {
        self.eigen_cutoff = cutoff.max(0.0);
        self
    }
}

static CONFIG: OnceLock<CurvatureConfig> = OnceLock::new();

/// Process-wide curvature defaults.
pub fn config() -> &'static CurvatureConfig {
    CONFIG.get_or_init(CurvatureConfig::from_env)
}
