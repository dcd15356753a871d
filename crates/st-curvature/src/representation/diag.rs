// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use spiral_config::curvature::EigenRoute;
use st_tensor::Tensor;

use super::{root, CurvatureMatrix, EigenCache, Lazy};
use crate::eigen::Eigendecomposition;
use crate::error::CurvatureResult;
use crate::generator::{Generator, Space};
use crate::vector::{Vector, VectorSpace};

/// Only the diagonal entries. Its eigenbasis is the identity.
pub struct Diagonal<'g> {
    generator: &'g Generator<'g>,
    values: Lazy<Vec<f32>>,
    eigen: EigenCache,
}

impl<'g> Diagonal<'g> {
    pub fn new(generator: &'g Generator<'g>) -> CurvatureResult<Self> {
        Ok(Self {
            generator,
            values: Lazy::default(),
            eigen: EigenCache::default(),
        })
    }

    pub fn values(&self) -> CurvatureResult<&[f32]> {
        Ok(self
            .values
            .get_or_try(|| self.generator.diagonal())?
            .as_slice())
    }
}

impl CurvatureMatrix for Diagonal<'_> {
    fn name(&self) -> &'static str {
        "diag"
    }

    fn space(&self) -> Space {
        self.generator.space()
    }

    fn vector_space(&self) -> VectorSpace {
        self.generator.vector_space()
    }

    fn get_matrix(&self) -> CurvatureResult<Tensor> {
        Ok(Tensor::from_diagonal(self.values()?)?)
    }

    fn mv(&self, v: &Vector) -> CurvatureResult<Vector> {
        v.expect_space(&self.vector_space())?;
        let product = self
            .values()?
            .iter()
            .zip(v.flat().iter())
            .map(|(d, x)| d * x)
            .collect();
        Vector::from_flat(self.vector_space(), product)
    }

    fn m_norm(&self, v: &Vector) -> CurvatureResult<f64> {
        v.expect_space(&self.vector_space())?;
        let weighted: f64 = self
            .values()?
            .iter()
            .zip(v.flat().iter())
            .map(|(&d, &x)| d as f64 * x as f64 * x as f64)
            .sum();
        Ok(root(weighted))
    }

    fn trace(&self) -> CurvatureResult<f64> {
        Ok(self.values()?.iter().map(|&d| d as f64).sum())
    }

    fn frobenius_norm(&self) -> CurvatureResult<f64> {
        Ok(self
            .values()?
            .iter()
            .map(|&d| d as f64 * d as f64)
            .sum::<f64>()
            .sqrt())
    }

    /// Every route yields the entries with the identity basis.
    fn compute_eigendecomposition(&mut self, _route: EigenRoute) -> CurvatureResult<()> {
        let decomposition = Eigendecomposition::from_diagonal(self.values()?)?;
        self.eigen.store(decomposition);
        Ok(())
    }

    fn eigendecomposition(&self) -> CurvatureResult<&Eigendecomposition> {
        self.eigen
            .get_or_compute(|| Eigendecomposition::from_diagonal(self.values()?))
    }
}
