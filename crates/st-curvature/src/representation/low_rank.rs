// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use spiral_config::curvature::EigenRoute;
use st_tensor::Tensor;

use super::{CurvatureMatrix, EigenCache, Lazy};
use crate::eigen::{self, Eigendecomposition};
use crate::error::CurvatureResult;
use crate::generator::{Generator, Space};
use crate::vector::{Vector, VectorSpace};

/// Factored `M = W Wᵀ` with `W` stacked straight from per-example gradients:
/// `Jᵀ/√N` in parameter space, `J` in example space. `G` itself is never
/// formed by the algebra below.
pub struct LowRank<'g> {
    generator: &'g Generator<'g>,
    factor: Lazy<Tensor>,
    eigen: EigenCache,
}

impl<'g> LowRank<'g> {
    pub fn new(generator: &'g Generator<'g>) -> CurvatureResult<Self> {
        Ok(Self {
            generator,
            factor: Lazy::default(),
            eigen: EigenCache::default(),
        })
    }

    /// Cached factor `W`, `(size, rank)`.
    pub fn factor(&self) -> CurvatureResult<&Tensor> {
        self.factor.get_or_try(|| self.generator.low_rank_factor())
    }

    /// `Wᵀ v`, accumulated in `f64`.
    fn pull(&self, v: &[f32]) -> CurvatureResult<Vec<f64>> {
        let factor = self.factor()?;
        let rank = factor.shape().1;
        let mut out = vec![0.0f64; rank];
        for (row, &x) in factor.data().chunks(rank).zip(v) {
            for (dst, &w) in out.iter_mut().zip(row) {
                *dst += w as f64 * x as f64;
            }
        }
        Ok(out)
    }

    fn decompose(&self, route: EigenRoute) -> CurvatureResult<Eigendecomposition> {
        let cutoff = self.generator.config().eigen_cutoff;
        match route {
            EigenRoute::Svd => eigen::from_factor(self.factor()?, cutoff),
            EigenRoute::Symmetric => eigen::from_factor_gram(self.factor()?, cutoff),
        }
    }
}

impl CurvatureMatrix for LowRank<'_> {
    fn name(&self) -> &'static str {
        "low_rank"
    }

    fn space(&self) -> Space {
        self.generator.space()
    }

    fn vector_space(&self) -> VectorSpace {
        self.generator.vector_space()
    }

    fn get_matrix(&self) -> CurvatureResult<Tensor> {
        let factor = self.factor()?;
        Ok(factor.matmul_transpose(factor)?)
    }

    fn mv(&self, v: &Vector) -> CurvatureResult<Vector> {
        v.expect_space(&self.vector_space())?;
        let pulled: Vec<f32> = self.pull(&v.flat())?.into_iter().map(|x| x as f32).collect();
        let product = self.factor()?.matvec(&pulled)?;
        Vector::from_flat(self.vector_space(), product)
    }

    fn m_norm(&self, v: &Vector) -> CurvatureResult<f64> {
        v.expect_space(&self.vector_space())?;
        Ok(self
            .pull(&v.flat())?
            .iter()
            .map(|x| x * x)
            .sum::<f64>()
            .sqrt())
    }

    /// `‖W‖_F²`.
    fn trace(&self) -> CurvatureResult<f64> {
        Ok(self.factor()?.squared_l2_norm())
    }

    /// `‖WᵀW‖_F`, through whichever of `WᵀW` and `WWᵀ` is smaller.
    fn frobenius_norm(&self) -> CurvatureResult<f64> {
        let factor = self.factor()?;
        let (rows, rank) = factor.shape();
        let gram = if rank <= rows {
            let columns = factor.transpose();
            columns.matmul_transpose(&columns)?
        } else {
            factor.matmul_transpose(factor)?
        };
        Ok(gram.squared_l2_norm().sqrt())
    }

    fn compute_eigendecomposition(&mut self, route: EigenRoute) -> CurvatureResult<()> {
        let decomposition = self.decompose(route)?;
        self.eigen.store(decomposition);
        Ok(())
    }

    /// Uses the configured route: the symmetric solver on the smaller Gram of
    /// the factor by default, the thin SVD of the factor for `Svd`.
    fn eigendecomposition(&self) -> CurvatureResult<&Eigendecomposition> {
        self.eigen
            .get_or_compute(|| self.decompose(self.generator.config().eigen_route))
    }
}
