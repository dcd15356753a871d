// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Interchangeable representations of one curvature matrix.
//!
//! All of them answer the same algebra through [`CurvatureMatrix`] and pull
//! what they need from a [`Generator`] on first use.

mod block_diag;
mod dense;
mod diag;
mod implicit;
mod low_rank;

use std::cell::OnceCell;
use std::fmt;
use std::str::FromStr;

use spiral_config::curvature::EigenRoute;
use st_tensor::Tensor;

use crate::eigen::Eigendecomposition;
use crate::error::{CurvatureError, CurvatureResult};
use crate::generator::{Generator, Space};
use crate::vector::{Vector, VectorSpace};

pub use block_diag::BlockDiagonal;
pub use dense::Dense;
pub use diag::Diagonal;
pub use implicit::Implicit;
pub use low_rank::LowRank;

/// Common algebra of every curvature representation.
pub trait CurvatureMatrix {
    /// Short label used in logs and errors.
    fn name(&self) -> &'static str;

    fn space(&self) -> Space;

    /// Space of the vectors this matrix acts on.
    fn vector_space(&self) -> VectorSpace;

    /// Side length.
    fn size(&self) -> usize {
        self.vector_space().len()
    }

    /// The full `size x size` matrix.
    fn get_matrix(&self) -> CurvatureResult<Tensor>;

    fn mv(&self, v: &Vector) -> CurvatureResult<Vector>;

    /// `sqrt(vᵀ M v)`.
    fn m_norm(&self, v: &Vector) -> CurvatureResult<f64>;

    fn trace(&self) -> CurvatureResult<f64>;

    fn frobenius_norm(&self) -> CurvatureResult<f64>;

    /// Recomputes and caches the eigendecomposition with `route`.
    fn compute_eigendecomposition(&mut self, route: EigenRoute) -> CurvatureResult<()>;

    /// Cached eigendecomposition, computed with the configured route on
    /// first use.
    fn eigendecomposition(&self) -> CurvatureResult<&Eigendecomposition>;

    /// Coordinates of `v` in the eigenbasis.
    fn project_to_diag(&self, v: &Vector) -> CurvatureResult<Vec<f32>> {
        v.expect_space(&self.vector_space())?;
        self.eigendecomposition()?.project(&v.flat())
    }

    /// Vector with the given eigenbasis coordinates.
    fn project_from_diag(&self, coordinates: &[f32]) -> CurvatureResult<Vector> {
        let data = self.eigendecomposition()?.unproject(coordinates)?;
        Vector::from_flat(self.vector_space(), data)
    }

    /// `Uᵀ A U` for a `size x size` matrix `A`.
    fn project_matrix_to_diag(&self, matrix: &Tensor) -> CurvatureResult<Tensor> {
        self.eigendecomposition()?.project_matrix(matrix)
    }
}

/// Selector for [`Generator::represent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RepresentationKind {
    Dense,
    BlockDiagonal,
    Diagonal,
    LowRank,
    Implicit,
}

impl RepresentationKind {
    pub const ALL: [RepresentationKind; 5] = [
        RepresentationKind::Dense,
        RepresentationKind::BlockDiagonal,
        RepresentationKind::Diagonal,
        RepresentationKind::LowRank,
        RepresentationKind::Implicit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RepresentationKind::Dense => "dense",
            RepresentationKind::BlockDiagonal => "block_diag",
            RepresentationKind::Diagonal => "diag",
            RepresentationKind::LowRank => "low_rank",
            RepresentationKind::Implicit => "implicit",
        }
    }
}

impl fmt::Display for RepresentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RepresentationKind {
    type Err = CurvatureError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        RepresentationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                CurvatureError::Configuration(format!("unknown curvature representation '{raw}'"))
            })
    }
}

impl<'a> Generator<'a> {
    /// Builds the requested representation on top of this generator.
    pub fn represent<'g>(
        &'g self,
        kind: RepresentationKind,
    ) -> CurvatureResult<Box<dyn CurvatureMatrix + 'g>> {
        Ok(match kind {
            RepresentationKind::Dense => Box::new(Dense::new(self)?),
            RepresentationKind::BlockDiagonal => Box::new(BlockDiagonal::new(self)?),
            RepresentationKind::Diagonal => Box::new(Diagonal::new(self)?),
            RepresentationKind::LowRank => Box::new(LowRank::new(self)?),
            RepresentationKind::Implicit => Box::new(Implicit::new(self)?),
        })
    }
}

/// Lazily filled eigendecomposition slot.
#[derive(Debug, Default)]
pub(crate) struct EigenCache {
    slot: OnceCell<Eigendecomposition>,
}

impl EigenCache {
    pub fn get_or_compute<F>(&self, compute: F) -> CurvatureResult<&Eigendecomposition>
    where
        F: FnOnce() -> CurvatureResult<Eigendecomposition>,
    {
        if let Some(eigen) = self.slot.get() {
            return Ok(eigen);
        }
        let eigen = compute()?;
        Ok(self.slot.get_or_init(|| eigen))
    }

    pub fn store(&mut self, eigen: Eigendecomposition) {
        self.slot = OnceCell::from(eigen);
    }
}

/// Lazily materialised value, filled by the first successful query.
#[derive(Debug)]
pub(crate) struct Lazy<T> {
    slot: OnceCell<T>,
}

impl<T> Default for Lazy<T> {
    fn default() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }
}

impl<T> Lazy<T> {
    pub fn get_or_try<F>(&self, compute: F) -> CurvatureResult<&T>
    where
        F: FnOnce() -> CurvatureResult<T>,
    {
        if let Some(value) = self.slot.get() {
            return Ok(value);
        }
        let value = compute()?;
        Ok(self.slot.get_or_init(|| value))
    }
}

/// `sqrt(max(q, 0))`; rounding can push a PSD quadratic form slightly below
/// zero.
pub(crate) fn root(quadratic: f64) -> f64 {
    quadratic.max(0.0).sqrt()
}

pub(crate) fn quadratic_form(v: &[f32], mv: &[f32]) -> f64 {
    v.iter()
        .zip(mv)
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum()
}
