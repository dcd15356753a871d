// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Eigendecompositions of materialised curvature matrices.
//!
//! Solvers run in `f64` through `nalgebra` and hand back `f32` tensors.
//! Eigenpairs are sorted by decreasing eigenvalue unless a constructor says
//! otherwise.

use nalgebra::{DMatrix, SymmetricEigen, SVD};
use spiral_config::curvature::EigenRoute;
use st_tensor::Tensor;

use crate::error::{CurvatureError, CurvatureResult};

/// Eigenvalues and the matching eigenvectors, stored as the columns of an
/// `(n, k)` tensor. A rank-zero decomposition (the zero matrix) keeps no
/// eigenvector tensor at all.
#[derive(Clone, Debug, PartialEq)]
pub struct Eigendecomposition {
    dimension: usize,
    eigenvalues: Vec<f32>,
    eigenvectors: Option<Tensor>,
    route: EigenRoute,
}

impl Eigendecomposition {
    pub fn eigenvalues(&self) -> &[f32] {
        &self.eigenvalues
    }

    /// Eigenvectors as columns; `None` when the rank is zero.
    pub fn eigenvectors(&self) -> Option<&Tensor> {
        self.eigenvectors.as_ref()
    }

    pub fn route(&self) -> EigenRoute {
        self.route
    }

    /// Dimension `n` of the decomposed matrix.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number `k` of retained eigenpairs.
    pub fn rank(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Coordinates `Uᵀ v` in the eigenbasis.
    pub fn project(&self, v: &[f32]) -> CurvatureResult<Vec<f32>> {
        if v.len() != self.dimension {
            return Err(CurvatureError::length(self.dimension, v.len()));
        }
        match &self.eigenvectors {
            Some(u) => Ok(u.transpose().matvec(v)?),
            None => Ok(Vec::new()),
        }
    }

    /// Back from eigenbasis coordinates, `U c`.
    pub fn unproject(&self, coordinates: &[f32]) -> CurvatureResult<Vec<f32>> {
        if coordinates.len() != self.rank() {
            return Err(CurvatureError::length(self.rank(), coordinates.len()));
        }
        match &self.eigenvectors {
            Some(u) => Ok(u.matvec(coordinates)?),
            None => Ok(vec![0.0; self.dimension]),
        }
    }

    /// `Uᵀ A U`; equals `diag(eigenvalues)` for the decomposed matrix itself.
    pub fn project_matrix(&self, matrix: &Tensor) -> CurvatureResult<Tensor> {
        let n = self.dimension;
        if matrix.shape() != (n, n) {
            return Err(CurvatureError::LayoutMismatch {
                expected: format!("{n}x{n} matrix"),
                got: format!("{}x{} matrix", matrix.shape().0, matrix.shape().1),
            });
        }
        let u = self.eigenvectors.as_ref().ok_or_else(|| {
            CurvatureError::unsupported("project_matrix", "a rank-zero eigenbasis")
        })?;
        let applied = matrix.matmul(u)?;
        Ok(u.transpose_matmul(&applied)?)
    }

    /// `U diag(λ) Uᵀ`.
    pub fn reconstruct(&self) -> CurvatureResult<Tensor> {
        match &self.eigenvectors {
            Some(u) => {
                let scaled = u.transpose().scale_rows(&self.eigenvalues)?;
                Ok(u.matmul(&scaled)?)
            }
            None => Ok(Tensor::zeros(self.dimension, self.dimension)?),
        }
    }

    /// Diagonal matrix: the entries themselves with the identity basis, in
    /// coordinate order.
    pub(crate) fn from_diagonal(values: &[f32]) -> CurvatureResult<Self> {
        Ok(Self {
            dimension: values.len(),
            eigenvalues: values.to_vec(),
            eigenvectors: Some(Tensor::identity(values.len())?),
            route: EigenRoute::Symmetric,
        })
    }

    /// Assembles per-block decompositions into one block-diagonal basis,
    /// block order preserved.
    pub(crate) fn block_diagonal(parts: &[Eigendecomposition]) -> CurvatureResult<Self> {
        let n: usize = parts.iter().map(Eigendecomposition::dimension).sum();
        let k: usize = parts.iter().map(Eigendecomposition::rank).sum();
        let mut data = vec![0.0f32; n * k];
        let mut eigenvalues = Vec::with_capacity(k);
        let (mut row0, mut col0) = (0, 0);
        for part in parts {
            if let Some(u) = &part.eigenvectors {
                let (rows, cols) = u.shape();
                for r in 0..rows {
                    let src = u.row(r)?;
                    let dst = (row0 + r) * k + col0;
                    data[dst..dst + cols].copy_from_slice(src);
                }
            }
            eigenvalues.extend_from_slice(&part.eigenvalues);
            row0 += part.dimension;
            col0 += part.rank();
        }
        let route = parts.first().map_or(EigenRoute::Symmetric, |p| p.route);
        let eigenvectors = if k == 0 {
            None
        } else {
            Some(Tensor::from_vec(n, k, data)?)
        };
        Ok(Self {
            dimension: n,
            eigenvalues,
            eigenvectors,
            route,
        })
    }
}

fn to_nalgebra(matrix: &Tensor) -> DMatrix<f64> {
    let (rows, cols) = matrix.shape();
    DMatrix::from_row_iterator(rows, cols, matrix.data().iter().map(|&v| v as f64))
}

fn descending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order
}

fn collect(
    values: &[f64],
    vectors: &DMatrix<f64>,
    order: &[usize],
    route: EigenRoute,
) -> CurvatureResult<Eigendecomposition> {
    let rows = vectors.nrows();
    let eigenvectors = if order.is_empty() {
        None
    } else {
        Some(Tensor::from_fn(rows, order.len(), |r, c| {
            vectors[(r, order[c])] as f32
        })?)
    };
    Ok(Eigendecomposition {
        dimension: rows,
        eigenvalues: order.iter().map(|&i| values[i] as f32).collect(),
        eigenvectors,
        route,
    })
}

/// Decomposes a symmetric PSD matrix with the requested solver. The SVD
/// route reads eigenvectors off the left singular vectors.
pub fn decompose(matrix: &Tensor, route: EigenRoute) -> CurvatureResult<Eigendecomposition> {
    let (rows, cols) = matrix.shape();
    if rows != cols {
        return Err(CurvatureError::LayoutMismatch {
            expected: "square matrix".into(),
            got: format!("{rows}x{cols} matrix"),
        });
    }
    let m = to_nalgebra(matrix);
    match route {
        EigenRoute::Symmetric => {
            let eigen = SymmetricEigen::try_new(m, f64::EPSILON, 0).ok_or_else(|| {
                CurvatureError::Eigen("symmetric eigensolver did not converge".into())
            })?;
            let values = eigen.eigenvalues.as_slice();
            collect(values, &eigen.eigenvectors, &descending(values), route)
        }
        EigenRoute::Svd => {
            let svd = SVD::try_new(m, true, false, f64::EPSILON, 0)
                .ok_or_else(|| CurvatureError::Eigen("SVD did not converge".into()))?;
            let u = svd
                .u
                .as_ref()
                .ok_or_else(|| CurvatureError::Eigen("SVD returned no left vectors".into()))?;
            let values = svd.singular_values.as_slice();
            collect(values, u, &descending(values), route)
        }
    }
}

/// Eigenpairs of `W Wᵀ` from the thin SVD of the factor `W`: eigenvalues are
/// the squared singular values, eigenvectors the left singular vectors.
/// Pairs whose eigenvalue falls under `cutoff` times the largest are dropped;
/// a zero factor yields a rank-zero decomposition.
pub fn from_factor(factor: &Tensor, cutoff: f64) -> CurvatureResult<Eigendecomposition> {
    let svd = SVD::try_new(to_nalgebra(factor), true, false, f64::EPSILON, 0)
        .ok_or_else(|| CurvatureError::Eigen("SVD of the low-rank factor did not converge".into()))?;
    let u = svd
        .u
        .as_ref()
        .ok_or_else(|| CurvatureError::Eigen("SVD returned no left vectors".into()))?;
    let squared: Vec<f64> = svd.singular_values.iter().map(|s| s * s).collect();
    let largest = squared.iter().copied().fold(0.0, f64::max);
    let order: Vec<usize> = descending(&squared)
        .into_iter()
        .filter(|&i| squared[i] > cutoff * largest && squared[i] > 0.0)
        .collect();
    collect(&squared, u, &order, EigenRoute::Svd)
}

/// Same eigenpairs as [`from_factor`], through the symmetric solver on the
/// smaller Gram matrix. A wide factor solves `W Wᵀ` directly. A tall one
/// solves `WᵀW = V Λ Vᵀ` and lifts the eigenvectors of `W Wᵀ` as
/// `W V Λ^{-1/2}`. The Gram is formed in `f64` so rounding noise in the null
/// space stays under the cutoff.
pub fn from_factor_gram(factor: &Tensor, cutoff: f64) -> CurvatureResult<Eigendecomposition> {
    let w = to_nalgebra(factor);
    let tall = w.nrows() > w.ncols();
    let small = if tall {
        w.transpose() * &w
    } else {
        &w * w.transpose()
    };
    let eigen = SymmetricEigen::try_new(small, f64::EPSILON, 0).ok_or_else(|| {
        CurvatureError::Eigen("symmetric eigensolver did not converge".into())
    })?;
    let values = eigen.eigenvalues.as_slice();
    let largest = values.iter().copied().fold(0.0, f64::max);
    let order: Vec<usize> = descending(values)
        .into_iter()
        .filter(|&i| values[i] > cutoff * largest && values[i] > 0.0)
        .collect();
    if !tall {
        return collect(values, &eigen.eigenvectors, &order, EigenRoute::Symmetric);
    }
    let mut lifted = &w * &eigen.eigenvectors;
    for &j in &order {
        lifted.column_mut(j).scale_mut(1.0 / values[j].sqrt());
    }
    collect(values, &lifted, &order, EigenRoute::Symmetric)
}
