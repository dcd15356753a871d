// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Matrix-vector products that never store the matrix.
//!
//! `Jᵀc` and `Jv` are accumulated layer by layer from the hook captures, so
//! the `(examples x parameters)` Jacobian is never formed.

use std::ops::Range;

use st_tensor::Tensor;

use super::context::{BatchWindow, LayerSink};
use super::kernel::LayerKernel;
use super::Generator;
use crate::error::{CurvatureError, CurvatureResult};

/// Accumulates `Jᵀc` for a coefficient per example.
struct PullbackSink {
    coefficients: Vec<f32>,
    ranges: Vec<Range<usize>>,
    out: Vec<f64>,
}

impl LayerSink for PullbackSink {
    fn accumulate(
        &mut self,
        layer: usize,
        kernel: &LayerKernel,
        window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()> {
        let coefficients = &self.coefficients[window.range()];
        let part = kernel.weighted_gradient_sum(input, grad_output, coefficients)?;
        let range = self.ranges[layer].clone();
        for (dst, value) in self.out[range].iter_mut().zip(part) {
            *dst += value as f64;
        }
        Ok(())
    }
}

/// Accumulates `Jv` for a parameter vector `v`.
struct PushforwardSink {
    v: Vec<f32>,
    ranges: Vec<Range<usize>>,
    out: Vec<f64>,
}

impl LayerSink for PushforwardSink {
    fn accumulate(
        &mut self,
        layer: usize,
        kernel: &LayerKernel,
        window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()> {
        let range = self.ranges[layer].clone();
        let products = kernel.gradient_products(input, grad_output, &self.v[range])?;
        for (dst, value) in self.out[window.range()].iter_mut().zip(products) {
            *dst += value;
        }
        Ok(())
    }
}

/// Keeps each layer's captures until the whole batch has run backward.
struct CaptureSink {
    captures: Vec<Option<(Tensor, Tensor)>>,
}

impl LayerSink for CaptureSink {
    fn begin_batch(&mut self, _window: BatchWindow) -> CurvatureResult<()> {
        self.captures.iter_mut().for_each(|slot| *slot = None);
        Ok(())
    }

    fn accumulate(
        &mut self,
        layer: usize,
        _kernel: &LayerKernel,
        _window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()> {
        if let Some(slot) = self.captures.get_mut(layer) {
            *slot = Some((input.clone(), grad_output.clone()));
        }
        Ok(())
    }
}

impl Generator<'_> {
    fn layer_ranges(&self) -> Vec<Range<usize>> {
        self.layout.slots().iter().map(|slot| slot.range()).collect()
    }

    fn expect_len(&self, v: &[f32], expected: usize) -> CurvatureResult<()> {
        if v.len() != expected {
            return Err(CurvatureError::length(expected, v.len()));
        }
        Ok(())
    }

    /// `Jᵀ c = Σ_i c_i g_i` in one pass; `c` has one entry per example.
    pub fn jacobian_transpose_product(&self, c: &[f32]) -> CurvatureResult<Vec<f32>> {
        self.expect_len(c, self.examples())?;
        let sink = PullbackSink {
            coefficients: c.to_vec(),
            ranges: self.layer_ranges(),
            out: vec![0.0; self.parameters()],
        };
        let sink = self.sweep("jacobian_transpose_product", sink, |_, _| Ok(()))?;
        Ok(sink.out.into_iter().map(|v| v as f32).collect())
    }

    /// `J v`, one `g_i · v` per example, in one pass.
    pub fn jacobian_product(&self, v: &[f32]) -> CurvatureResult<Vec<f64>> {
        self.expect_len(v, self.parameters())?;
        let sink = PushforwardSink {
            v: v.to_vec(),
            ranges: self.layer_ranges(),
            out: vec![0.0; self.examples()],
        };
        Ok(self.sweep("jacobian_product", sink, |_, _| Ok(()))?.out)
    }

    /// `G v = (1/N) Σ_b J_bᵀ (J_b v)` in one pass: each batch is pushed
    /// forward and pulled back once all its layers have run backward.
    pub fn parameter_matrix_product(&self, v: &[f32]) -> CurvatureResult<Vec<f32>> {
        self.expect_len(v, self.parameters())?;
        let ranges = self.layer_ranges();
        let kernels = self.kernels();
        let mut out = vec![0.0f64; self.parameters()];
        let sink = CaptureSink {
            captures: vec![None; self.layers.len()],
        };
        self.sweep("parameter_matrix_product", sink, |sink, window| {
            let mut products = vec![0.0f64; window.rows];
            let mut captured = Vec::with_capacity(kernels.len());
            for (layer, kernel) in kernels.iter().enumerate() {
                let (input, grad) = sink.captures[layer].take().ok_or_else(|| {
                    CurvatureError::Instrumentation {
                        layer,
                        message: "captures missing after the backward pass".into(),
                    }
                })?;
                let part = kernel.gradient_products(&input, &grad, &v[ranges[layer].clone()])?;
                products.iter_mut().zip(part).for_each(|(p, x)| *p += x);
                captured.push((input, grad));
            }
            let coefficients: Vec<f32> = products.iter().map(|&p| p as f32).collect();
            for (layer, (input, grad)) in captured.iter().enumerate() {
                let part = kernels[layer].weighted_gradient_sum(input, grad, &coefficients)?;
                for (dst, value) in out[ranges[layer].clone()].iter_mut().zip(part) {
                    *dst += value as f64;
                }
            }
            Ok(())
        })?;
        let n = self.examples() as f64;
        Ok(out.into_iter().map(|v| (v / n) as f32).collect())
    }

    /// `K v = J (Jᵀ v)` in two passes.
    pub fn example_matrix_product(&self, v: &[f32]) -> CurvatureResult<Vec<f32>> {
        let pulled = self.jacobian_transpose_product(v)?;
        Ok(self
            .jacobian_product(&pulled)?
            .into_iter()
            .map(|p| p as f32)
            .collect())
    }
}
