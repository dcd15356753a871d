// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Closed-form per-example quantities of the supported layer kinds.
//!
//! Every formula works from the two captures an instrumented layer yields for
//! a batch: its input rows `X` and its output-gradient rows `GY`. Per-example
//! gradients are laid out weight first (row-major, as the layer stores it)
//! followed by the bias.

use st_nn::{ConvGeometry, LayerSpec};
use st_tensor::{Tensor, TensorError};

use crate::error::{CurvatureError, CurvatureResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKernel {
    /// `y = x W + b`, `W` of shape `(input_dim, output_dim)`.
    Affine {
        input_dim: usize,
        output_dim: usize,
        bias: bool,
    },
    /// im2col convolution, `W` of shape `(out_channels, kernel_span)`.
    Convolution { geometry: ConvGeometry, bias: bool },
}

/// What one layer keeps from a batch to pair it with another batch later.
#[derive(Clone, Debug)]
pub(crate) enum BatchFactors {
    Affine { input: Tensor, grad: Tensor },
    /// Stacked per-example gradients, `(batch, parameter_count)`.
    Gradients(Tensor),
}

impl LayerKernel {
    pub fn from_spec(spec: LayerSpec) -> CurvatureResult<Self> {
        match spec {
            LayerSpec::Affine {
                input_dim,
                output_dim,
                bias,
            } => Ok(LayerKernel::Affine {
                input_dim,
                output_dim,
                bias,
            }),
            LayerSpec::Convolution { geometry, bias } => {
                Ok(LayerKernel::Convolution { geometry, bias })
            }
            other => Err(CurvatureError::Configuration(format!(
                "no curvature formula for layer kind {other:?}"
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LayerKernel::Affine { .. } => "affine",
            LayerKernel::Convolution { .. } => "convolution",
        }
    }

    pub fn weight_len(&self) -> usize {
        match *self {
            LayerKernel::Affine {
                input_dim,
                output_dim,
                ..
            } => input_dim * output_dim,
            LayerKernel::Convolution { geometry, .. } => {
                geometry.out_channels * geometry.kernel_span()
            }
        }
    }

    pub fn bias_len(&self) -> usize {
        match *self {
            LayerKernel::Affine {
                output_dim, bias, ..
            } => usize::from(bias) * output_dim,
            LayerKernel::Convolution { geometry, bias } => {
                usize::from(bias) * geometry.out_channels
            }
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.weight_len() + self.bias_len()
    }

    fn has_bias(&self) -> bool {
        match *self {
            LayerKernel::Affine { bias, .. } | LayerKernel::Convolution { bias, .. } => bias,
        }
    }

    fn io_len(&self) -> (usize, usize) {
        match *self {
            LayerKernel::Affine {
                input_dim,
                output_dim,
                ..
            } => (input_dim, output_dim),
            LayerKernel::Convolution { geometry, .. } => {
                (geometry.input_len(), geometry.output_len())
            }
        }
    }

    /// Checks the captures against the layer shape and returns the batch size.
    fn batch_rows(&self, input: &Tensor, grad_output: &Tensor) -> CurvatureResult<usize> {
        let (input_len, output_len) = self.io_len();
        let rows = input.shape().0;
        if input.shape().1 != input_len {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (rows, input_len),
            }
            .into());
        }
        if grad_output.shape() != (rows, output_len) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (rows, output_len),
            }
            .into());
        }
        Ok(rows)
    }

    fn split<'v>(&self, values: &'v [f32]) -> CurvatureResult<(&'v [f32], &'v [f32])> {
        if values.len() != self.parameter_count() {
            return Err(CurvatureError::length(self.parameter_count(), values.len()));
        }
        Ok(values.split_at(self.weight_len()))
    }

    /// Stacked per-example gradients, `(batch, parameter_count)`.
    pub fn per_example_gradients(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<Tensor> {
        let rows = self.batch_rows(input, grad_output)?;
        let width = self.parameter_count();
        let mut data = Vec::with_capacity(rows * width);
        match *self {
            LayerKernel::Affine { bias, .. } => {
                for r in 0..rows {
                    let x = input.row(r)?;
                    let gy = grad_output.row(r)?;
                    for &xa in x {
                        data.extend(gy.iter().map(|&gb| xa * gb));
                    }
                    if bias {
                        data.extend_from_slice(gy);
                    }
                }
            }
            LayerKernel::Convolution { geometry, bias } => {
                let (patches, grads) = conv_matrices(&geometry, input, grad_output)?;
                let spatial = geometry.spatial();
                for r in 0..rows {
                    let window = r * spatial..(r + 1) * spatial;
                    let patch = patches.slice_rows(window.start, window.end)?;
                    let grad = grads.slice_rows(window.start, window.end)?;
                    data.extend_from_slice(grad.transpose_matmul(&patch)?.data());
                    if bias {
                        data.extend(grad.sum_axis0());
                    }
                }
            }
        }
        Ok(Tensor::from_vec(rows, width, data)?)
    }

    pub(crate) fn factors(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<BatchFactors> {
        match self {
            LayerKernel::Affine { .. } => {
                self.batch_rows(input, grad_output)?;
                Ok(BatchFactors::Affine {
                    input: input.clone(),
                    grad: grad_output.clone(),
                })
            }
            LayerKernel::Convolution { .. } => Ok(BatchFactors::Gradients(
                self.per_example_gradients(input, grad_output)?,
            )),
        }
    }

    /// Gram contribution `[a_rows, b_rows]` of this layer, entry `(i, j)`
    /// being `g_a[i] · g_b[j]`. Swapping the arguments yields the exact
    /// transpose.
    pub(crate) fn gram_block(
        &self,
        layer: usize,
        a: &BatchFactors,
        b: &BatchFactors,
    ) -> CurvatureResult<Tensor> {
        match (a, b) {
            (
                BatchFactors::Affine {
                    input: xa,
                    grad: ga,
                },
                BatchFactors::Affine {
                    input: xb,
                    grad: gb,
                },
            ) => {
                let grads = ga.matmul_transpose(gb)?;
                let mut block = xa.matmul_transpose(xb)?.hadamard(&grads)?;
                if self.has_bias() {
                    block.add_scaled(&grads, 1.0)?;
                }
                Ok(block)
            }
            (BatchFactors::Gradients(a), BatchFactors::Gradients(b)) => {
                Ok(a.matmul_transpose(b)?)
            }
            _ => Err(CurvatureError::Instrumentation {
                layer,
                message: "captures of the two batches disagree on the layer kind".into(),
            }),
        }
    }

    /// `Σ_i c_i g_i` over the batch, i.e. this layer's slice of `Jᵀ c`.
    pub fn weighted_gradient_sum(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        coefficients: &[f32],
    ) -> CurvatureResult<Vec<f32>> {
        let rows = self.batch_rows(input, grad_output)?;
        if coefficients.len() != rows {
            return Err(CurvatureError::length(rows, coefficients.len()));
        }
        let mut out = Vec::with_capacity(self.parameter_count());
        match *self {
            LayerKernel::Affine { bias, .. } => {
                let scaled = grad_output.scale_rows(coefficients)?;
                out.extend_from_slice(input.transpose_matmul(&scaled)?.data());
                if bias {
                    out.extend(scaled.sum_axis0());
                }
            }
            LayerKernel::Convolution { geometry, bias } => {
                let (patches, grads) = conv_matrices(&geometry, input, grad_output)?;
                let spatial = geometry.spatial();
                let expanded: Vec<f32> = coefficients
                    .iter()
                    .flat_map(|&c| std::iter::repeat(c).take(spatial))
                    .collect();
                let scaled = grads.scale_rows(&expanded)?;
                out.extend_from_slice(scaled.transpose_matmul(&patches)?.data());
                if bias {
                    out.extend(scaled.sum_axis0());
                }
            }
        }
        Ok(out)
    }

    /// `g_i · v` for every example of the batch, i.e. this layer's share of
    /// `J v`. `v` is the layer's slice of a parameter vector.
    pub fn gradient_products(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        v: &[f32],
    ) -> CurvatureResult<Vec<f64>> {
        let rows = self.batch_rows(input, grad_output)?;
        let (weight, bias) = self.split(v)?;
        let (projected, grads, group) = match *self {
            LayerKernel::Affine {
                input_dim,
                output_dim,
                ..
            } => {
                let weight = Tensor::from_vec(input_dim, output_dim, weight.to_vec())?;
                (input.matmul(&weight)?, grad_output.clone(), 1)
            }
            LayerKernel::Convolution { geometry, .. } => {
                let (patches, grads) = conv_matrices(&geometry, input, grad_output)?;
                let weight = Tensor::from_vec(
                    geometry.out_channels,
                    geometry.kernel_span(),
                    weight.to_vec(),
                )?;
                (patches.matmul_transpose(&weight)?, grads, geometry.spatial())
            }
        };
        let width = projected.shape().1;
        let mut products = vec![0.0f64; rows];
        for (row, (p, g)) in projected
            .data()
            .chunks(width)
            .zip(grads.data().chunks(width))
            .enumerate()
        {
            let mut acc = 0.0f64;
            for (col, (&pv, &gv)) in p.iter().zip(g).enumerate() {
                let shift = bias.get(col).copied().unwrap_or(0.0);
                acc += (pv + shift) as f64 * gv as f64;
            }
            products[row / group] += acc;
        }
        Ok(products)
    }

    /// `‖g_i‖²` for every example of the batch.
    pub fn squared_norms(&self, input: &Tensor, grad_output: &Tensor) -> CurvatureResult<Vec<f64>> {
        match *self {
            LayerKernel::Affine { bias, .. } => {
                let rows = self.batch_rows(input, grad_output)?;
                (0..rows)
                    .map(|r| {
                        let x: f64 = input.row(r)?.iter().map(|&v| v as f64 * v as f64).sum();
                        let gy: f64 = grad_output
                            .row(r)?
                            .iter()
                            .map(|&v| v as f64 * v as f64)
                            .sum();
                        Ok(x * gy + if bias { gy } else { 0.0 })
                    })
                    .collect()
            }
            LayerKernel::Convolution { .. } => {
                let grads = self.per_example_gradients(input, grad_output)?;
                let width = grads.shape().1;
                Ok(grads
                    .data()
                    .chunks(width)
                    .map(|row| row.iter().map(|&v| v as f64 * v as f64).sum())
                    .collect())
            }
        }
    }
}

/// Patches `(batch * spatial, span)` and output gradients
/// `(batch * spatial, out_channels)` of a convolution.
fn conv_matrices(
    geometry: &ConvGeometry,
    input: &Tensor,
    grad_output: &Tensor,
) -> CurvatureResult<(Tensor, Tensor)> {
    Ok((
        geometry.im2col(input)?,
        geometry.output_to_matrix(grad_output)?,
    ))
}
