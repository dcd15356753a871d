// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use spiral_config::curvature::EigenRoute;
use st_tensor::Tensor;

use super::{quadratic_form, root, CurvatureMatrix, EigenCache, Lazy};
use crate::eigen::{self, Eigendecomposition};
use crate::error::CurvatureResult;
use crate::generator::{Generator, Space};
use crate::vector::{Vector, VectorSpace};

/// Fully materialised matrix: the Gram matrix in example space, `Σ J_bᵀJ_b/N`
/// in parameter space. Built on first use and cached.
pub struct Dense<'g> {
    generator: &'g Generator<'g>,
    matrix: Lazy<Tensor>,
    eigen: EigenCache,
}

impl<'g> Dense<'g> {
    pub fn new(generator: &'g Generator<'g>) -> CurvatureResult<Self> {
        Ok(Self {
            generator,
            matrix: Lazy::default(),
            eigen: EigenCache::default(),
        })
    }

    /// Cached matrix.
    pub fn matrix(&self) -> CurvatureResult<&Tensor> {
        self.matrix.get_or_try(|| self.generator.dense_matrix())
    }
}

impl CurvatureMatrix for Dense<'_> {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn space(&self) -> Space {
        self.generator.space()
    }

    fn vector_space(&self) -> VectorSpace {
        self.generator.vector_space()
    }

    fn get_matrix(&self) -> CurvatureResult<Tensor> {
        self.matrix().cloned()
    }

    fn mv(&self, v: &Vector) -> CurvatureResult<Vector> {
        v.expect_space(&self.vector_space())?;
        let product = self.matrix()?.matvec(&v.flat())?;
        Vector::from_flat(self.vector_space(), product)
    }

    fn m_norm(&self, v: &Vector) -> CurvatureResult<f64> {
        v.expect_space(&self.vector_space())?;
        let flat = v.flat();
        let product = self.matrix()?.matvec(&flat)?;
        Ok(root(quadratic_form(&flat, &product)))
    }

    fn trace(&self) -> CurvatureResult<f64> {
        Ok(self.matrix()?.trace()?)
    }

    fn frobenius_norm(&self) -> CurvatureResult<f64> {
        Ok(self.matrix()?.squared_l2_norm().sqrt())
    }

    fn compute_eigendecomposition(&mut self, route: EigenRoute) -> CurvatureResult<()> {
        let decomposition = eigen::decompose(self.matrix()?, route)?;
        self.eigen.store(decomposition);
        Ok(())
    }

    fn eigendecomposition(&self) -> CurvatureResult<&Eigendecomposition> {
        self.eigen.get_or_compute(|| {
            eigen::decompose(self.matrix()?, self.generator.config().eigen_route)
        })
    }
}
