// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Layer-local statistics: squared norms, diagonal, per-layer blocks and the
//! stacked per-example gradients.

use std::ops::Range;

use st_tensor::Tensor;

use super::context::{BatchWindow, LayerSink};
use super::kernel::LayerKernel;
use super::{Generator, Space};
use crate::error::{CurvatureError, CurvatureResult};

struct NormSink {
    norms: Vec<f64>,
}

impl LayerSink for NormSink {
    fn accumulate(
        &mut self,
        _layer: usize,
        kernel: &LayerKernel,
        window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()> {
        let norms = kernel.squared_norms(input, grad_output)?;
        for (dst, value) in self.norms[window.range()].iter_mut().zip(norms) {
            *dst += value;
        }
        Ok(())
    }
}

struct DiagonalSink {
    ranges: Vec<Range<usize>>,
    sums: Vec<f64>,
}

impl LayerSink for DiagonalSink {
    fn accumulate(
        &mut self,
        layer: usize,
        kernel: &LayerKernel,
        _window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()> {
        let grads = kernel.per_example_gradients(input, grad_output)?;
        let width = grads.shape().1;
        let sums = &mut self.sums[self.ranges[layer].clone()];
        for row in grads.data().chunks(width) {
            for (dst, &g) in sums.iter_mut().zip(row) {
                *dst += g as f64 * g as f64;
            }
        }
        Ok(())
    }
}

/// Per-layer `Σ_i g_i g_iᵀ`.
struct BlockSink {
    blocks: Vec<Option<Tensor>>,
}

impl LayerSink for BlockSink {
    fn accumulate(
        &mut self,
        layer: usize,
        kernel: &LayerKernel,
        _window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()> {
        let columns = kernel.per_example_gradients(input, grad_output)?.transpose();
        let contribution = columns.matmul_transpose(&columns)?;
        match self.blocks.get_mut(layer) {
            Some(Some(block)) => block.add_scaled(&contribution, 1.0)?,
            Some(slot) => *slot = Some(contribution),
            None => {}
        }
        Ok(())
    }
}

/// Per-example gradients of the current batch, one tensor per layer.
struct GradientSink {
    layers: Vec<Option<Tensor>>,
}

impl GradientSink {
    /// Assembles `J_b`, `(batch, parameters)`, in flat parameter order.
    fn take_jacobian(&mut self, ranges: &[Range<usize>], rows: usize) -> CurvatureResult<Tensor> {
        let width = ranges.last().map_or(0, |range| range.end);
        let mut data = vec![0.0f32; rows * width];
        for (layer, range) in ranges.iter().enumerate() {
            let grads = self.layers[layer]
                .take()
                .ok_or_else(|| CurvatureError::Instrumentation {
                    layer,
                    message: "per-example gradients missing after the backward pass".into(),
                })?;
            for (r, row) in grads.data().chunks(range.len()).enumerate() {
                data[r * width + range.start..r * width + range.end].copy_from_slice(row);
            }
        }
        Ok(Tensor::from_vec(rows, width, data)?)
    }
}

impl LayerSink for GradientSink {
    fn accumulate(
        &mut self,
        layer: usize,
        kernel: &LayerKernel,
        _window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()> {
        if let Some(slot) = self.layers.get_mut(layer) {
            *slot = Some(kernel.per_example_gradients(input, grad_output)?);
        }
        Ok(())
    }
}

impl Generator<'_> {
    /// `‖g_i‖²` for every example, in loader order.
    pub fn squared_gradient_norms(&self) -> CurvatureResult<Vec<f64>> {
        let sink = NormSink {
            norms: vec![0.0; self.examples()],
        };
        Ok(self.sweep("squared_gradient_norms", sink, |_, _| Ok(()))?.norms)
    }

    /// Diagonal of `G`, `(1/N) Σ_i g_i ⊙ g_i`.
    pub fn parameter_diagonal(&self) -> CurvatureResult<Vec<f32>> {
        self.announce("parameter_diagonal");
        let sink = DiagonalSink {
            ranges: self.layout.slots().iter().map(|slot| slot.range()).collect(),
            sums: vec![0.0; self.parameters()],
        };
        let sink = self.sweep("parameter_diagonal", sink, |_, _| Ok(()))?;
        let n = self.examples() as f64;
        Ok(sink.sums.into_iter().map(|v| (v / n) as f32).collect())
    }

    /// Diagonal blocks of `G`, one per supported layer. Example space has no
    /// per-layer structure.
    pub fn layer_blocks(&self) -> CurvatureResult<Vec<Tensor>> {
        if self.space == Space::Example {
            return Err(CurvatureError::unsupported(
                "layer_blocks",
                "example-space generators",
            ));
        }
        self.announce("layer_blocks");
        let sink = BlockSink {
            blocks: vec![None; self.layers.len()],
        };
        let sink = self.sweep("layer_blocks", sink, |_, _| Ok(()))?;
        let scale = 1.0 / self.examples() as f32;
        sink.blocks
            .into_iter()
            .enumerate()
            .map(|(layer, block)| {
                let block = block.ok_or_else(|| CurvatureError::Instrumentation {
                    layer,
                    message: "no block was accumulated".into(),
                })?;
                Ok(block.scale(scale)?)
            })
            .collect()
    }

    /// Stacked per-example gradients `J`, `(examples, parameters)`.
    pub fn jacobian(&self) -> CurvatureResult<Tensor> {
        self.announce("jacobian");
        let ranges: Vec<_> = self.layout.slots().iter().map(|slot| slot.range()).collect();
        let mut batches = Vec::with_capacity(self.loader.num_batches());
        let sink = GradientSink {
            layers: vec![None; self.layers.len()],
        };
        self.sweep("jacobian", sink, |sink, window| {
            batches.push(sink.take_jacobian(&ranges, window.rows)?);
            Ok(())
        })?;
        Ok(Tensor::cat_rows(&batches)?)
    }

    /// Dense `G = (1/N) Σ_b J_bᵀ J_b`, assembled batch by batch.
    pub fn parameter_matrix(&self) -> CurvatureResult<Tensor> {
        self.announce("parameter_matrix");
        let ranges: Vec<_> = self.layout.slots().iter().map(|slot| slot.range()).collect();
        let mut total: Option<Tensor> = None;
        let sink = GradientSink {
            layers: vec![None; self.layers.len()],
        };
        self.sweep("parameter_matrix", sink, |sink, window| {
            let columns = sink.take_jacobian(&ranges, window.rows)?.transpose();
            let contribution = columns.matmul_transpose(&columns)?;
            match total.as_mut() {
                Some(total) => total.add_scaled(&contribution, 1.0)?,
                None => total = Some(contribution),
            }
            Ok(())
        })?;
        let total = total.ok_or_else(|| {
            CurvatureError::Configuration("data loader yielded no batches".into())
        })?;
        Ok(total.scale(1.0 / self.examples() as f32)?)
    }
}
