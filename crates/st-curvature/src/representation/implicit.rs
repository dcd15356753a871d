// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use spiral_config::curvature::EigenRoute;
use st_tensor::Tensor;
use tracing::debug;

use super::CurvatureMatrix;
use crate::eigen::Eigendecomposition;
use crate::error::{CurvatureError, CurvatureResult};
use crate::generator::{Generator, Space};
use crate::vector::{Vector, VectorSpace};

/// Stores nothing; every query re-runs instrumented passes.
pub struct Implicit<'g> {
    generator: &'g Generator<'g>,
}

impl<'g> Implicit<'g> {
    pub fn new(generator: &'g Generator<'g>) -> CurvatureResult<Self> {
        Ok(Self { generator })
    }

    fn unsupported(&self, operation: &'static str) -> CurvatureError {
        CurvatureError::unsupported(operation, "the implicit representation")
    }
}

impl CurvatureMatrix for Implicit<'_> {
    fn name(&self) -> &'static str {
        "implicit"
    }

    fn space(&self) -> Space {
        self.generator.space()
    }

    fn vector_space(&self) -> VectorSpace {
        self.generator.vector_space()
    }

    fn get_matrix(&self) -> CurvatureResult<Tensor> {
        Err(self.unsupported("get_matrix"))
    }

    fn mv(&self, v: &Vector) -> CurvatureResult<Vector> {
        v.expect_space(&self.vector_space())?;
        debug!(space = %self.space(), "implicit mv");
        let product = self.generator.matrix_vector_product(&v.flat())?;
        Vector::from_flat(self.vector_space(), product)
    }

    fn m_norm(&self, v: &Vector) -> CurvatureResult<f64> {
        v.expect_space(&self.vector_space())?;
        self.generator.m_norm(&v.flat())
    }

    fn trace(&self) -> CurvatureResult<f64> {
        self.generator.trace()
    }

    fn frobenius_norm(&self) -> CurvatureResult<f64> {
        self.generator.frobenius_norm()
    }

    fn compute_eigendecomposition(&mut self, _route: EigenRoute) -> CurvatureResult<()> {
        Err(self.unsupported("compute_eigendecomposition"))
    }

    fn eigendecomposition(&self) -> CurvatureResult<&Eigendecomposition> {
        Err(self.unsupported("eigendecomposition"))
    }
}
