// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use spiral_config::curvature::EigenRoute;
use st_tensor::Tensor;

use super::{quadratic_form, root, CurvatureMatrix, EigenCache, Lazy};
use crate::eigen::{self, Eigendecomposition};
use crate::error::{CurvatureError, CurvatureResult};
use crate::generator::{Generator, Space};
use crate::vector::{Vector, VectorSpace};

/// One dense block per supported layer, zero across layers. Parameter space
/// only.
pub struct BlockDiagonal<'g> {
    generator: &'g Generator<'g>,
    blocks: Lazy<Vec<Tensor>>,
    eigen: EigenCache,
}

impl<'g> BlockDiagonal<'g> {
    pub fn new(generator: &'g Generator<'g>) -> CurvatureResult<Self> {
        if generator.space() == Space::Example {
            return Err(CurvatureError::unsupported(
                "block-diagonal representation",
                "example space",
            ));
        }
        Ok(Self {
            generator,
            blocks: Lazy::default(),
            eigen: EigenCache::default(),
        })
    }

    /// Cached per-layer blocks in layout order.
    pub fn blocks(&self) -> CurvatureResult<&[Tensor]> {
        Ok(self
            .blocks
            .get_or_try(|| self.generator.layer_blocks())?
            .as_slice())
    }

    fn apply(&self, v: &[f32]) -> CurvatureResult<Vec<f32>> {
        let mut out = Vec::with_capacity(v.len());
        for (slot, block) in self.generator.layout().slots().iter().zip(self.blocks()?) {
            out.extend(block.matvec(&v[slot.range()])?);
        }
        Ok(out)
    }

    fn decompose(&self, route: EigenRoute) -> CurvatureResult<Eigendecomposition> {
        let parts = self
            .blocks()?
            .iter()
            .map(|block| eigen::decompose(block, route))
            .collect::<CurvatureResult<Vec<_>>>()?;
        Eigendecomposition::block_diagonal(&parts)
    }
}

impl CurvatureMatrix for BlockDiagonal<'_> {
    fn name(&self) -> &'static str {
        "block_diag"
    }

    fn space(&self) -> Space {
        Space::Parameter
    }

    fn vector_space(&self) -> VectorSpace {
        self.generator.vector_space()
    }

    fn get_matrix(&self) -> CurvatureResult<Tensor> {
        let n = self.size();
        let mut data = vec![0.0f32; n * n];
        for (slot, block) in self.generator.layout().slots().iter().zip(self.blocks()?) {
            let width = slot.len();
            for (r, row) in block.data().chunks(width).enumerate() {
                let start = (slot.offset + r) * n + slot.offset;
                data[start..start + width].copy_from_slice(row);
            }
        }
        Ok(Tensor::from_vec(n, n, data)?)
    }

    fn mv(&self, v: &Vector) -> CurvatureResult<Vector> {
        v.expect_space(&self.vector_space())?;
        let product = self.apply(&v.flat())?;
        Vector::from_flat(self.vector_space(), product)
    }

    fn m_norm(&self, v: &Vector) -> CurvatureResult<f64> {
        v.expect_space(&self.vector_space())?;
        let flat = v.flat();
        let product = self.apply(&flat)?;
        Ok(root(quadratic_form(&flat, &product)))
    }

    fn trace(&self) -> CurvatureResult<f64> {
        self.blocks()?
            .iter()
            .map(|block| block.trace().map_err(CurvatureError::from))
            .sum()
    }

    fn frobenius_norm(&self) -> CurvatureResult<f64> {
        let squared: f64 = self.blocks()?.iter().map(Tensor::squared_l2_norm).sum();
        Ok(squared.sqrt())
    }

    fn compute_eigendecomposition(&mut self, route: EigenRoute) -> CurvatureResult<()> {
        let decomposition = self.decompose(route)?;
        self.eigen.store(decomposition);
        Ok(())
    }

    fn eigendecomposition(&self) -> CurvatureResult<&Eigendecomposition> {
        self.eigen
            .get_or_compute(|| self.decompose(self.generator.config().eigen_route))
    }
}
