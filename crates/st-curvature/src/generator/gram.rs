// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Example-space Gram matrix by two nested sweeps.
//!
//! For every outer batch `o` the outer batch is run once and each layer keeps
//! its captures. Every inner batch `i <= o` is then run and paired with them,
//! producing block `[inner rows, outer rows]`. Blocks below the diagonal are
//! mirrored; diagonal blocks are always computed from a fresh inner pass.

use std::ops::Range;
use std::rc::Rc;

use st_nn::LayerHook;
use st_tensor::Tensor;
use tracing::debug;

use super::context::{BatchWindow, InstrumentationScope, LayerSink, Phase, QueryContext};
use super::kernel::{BatchFactors, LayerKernel};
use super::Generator;
use crate::error::{CurvatureError, CurvatureResult};

/// One finished block of the Gram matrix, `inner.len() x outer.len()`.
pub(crate) struct GramBlock<'b> {
    pub inner: Range<usize>,
    pub outer: Range<usize>,
    pub values: &'b Tensor,
}

impl GramBlock<'_> {
    pub fn is_diagonal(&self) -> bool {
        self.inner == self.outer
    }
}

struct GramSink {
    outer: Vec<Option<BatchFactors>>,
    block: Option<Tensor>,
}

impl GramSink {
    fn new(layers: usize) -> Self {
        Self {
            outer: vec![None; layers],
            block: None,
        }
    }

    fn evict_outer(&mut self) {
        self.outer.iter_mut().for_each(|slot| *slot = None);
    }

    fn take_block(&mut self) -> CurvatureResult<Tensor> {
        self.block.take().ok_or_else(|| CurvatureError::Instrumentation {
            layer: 0,
            message: "inner pass produced no Gram block".into(),
        })
    }
}

impl LayerSink for GramSink {
    fn begin_batch(&mut self, window: BatchWindow) -> CurvatureResult<()> {
        match window.phase {
            Phase::Outer => self.evict_outer(),
            Phase::Inner => self.block = None,
        }
        Ok(())
    }

    fn accumulate(
        &mut self,
        layer: usize,
        kernel: &LayerKernel,
        window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()> {
        let factors = kernel.factors(input, grad_output)?;
        match window.phase {
            Phase::Outer => {
                if let Some(slot) = self.outer.get_mut(layer) {
                    *slot = Some(factors);
                }
            }
            Phase::Inner => {
                let outer = self
                    .outer
                    .get(layer)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| CurvatureError::Instrumentation {
                        layer,
                        message: "no outer capture to pair the inner batch with".into(),
                    })?;
                let contribution = kernel.gram_block(layer, &factors, outer)?;
                match self.block.as_mut() {
                    Some(block) => block.add_scaled(&contribution, 1.0)?,
                    None => self.block = Some(contribution),
                }
            }
        }
        Ok(())
    }
}

impl Generator<'_> {
    /// Streams the lower block triangle of `K`, one block at a time.
    pub(crate) fn gram_sweep<F>(&self, mut on_block: F) -> CurvatureResult<()>
    where
        F: FnMut(GramBlock<'_>) -> CurvatureResult<()>,
    {
        let context = Rc::new(QueryContext::new(
            self.kernels(),
            GramSink::new(self.layers.len()),
        ));
        {
            let hook: Rc<dyn LayerHook> = context.clone();
            let _scope = InstrumentationScope::attach(&self.hook_points(), hook);
            let mut outer_offset = 0;
            let mut passes = 0usize;
            for (index, outer) in self.loader.iter().enumerate() {
                let (inputs, targets) = outer?;
                let outer_window = BatchWindow {
                    offset: outer_offset,
                    rows: inputs.shape().0,
                    phase: Phase::Outer,
                };
                self.run_batch(&context, outer_window, &inputs, &targets)?;
                passes += 1;

                let mut inner_offset = 0;
                for inner in self.loader.iter().take(index + 1) {
                    let (inputs, targets) = inner?;
                    let inner_window = BatchWindow {
                        offset: inner_offset,
                        rows: inputs.shape().0,
                        phase: Phase::Inner,
                    };
                    self.run_batch(&context, inner_window, &inputs, &targets)?;
                    passes += 1;
                    let values = context.sink_mut().take_block()?;
                    on_block(GramBlock {
                        inner: inner_window.range(),
                        outer: outer_window.range(),
                        values: &values,
                    })?;
                    inner_offset += inner_window.rows;
                }
                if self.config.evict_outer {
                    context.sink_mut().evict_outer();
                }
                outer_offset += outer_window.rows;
            }
            self.check_coverage(outer_offset)?;
            debug!(passes, examples = outer_offset, "gram sweep finished");
        }
        context.into_sink().map(drop)
    }

    /// Full `N x N` Gram matrix `K[i, j] = g_i · g_j`.
    pub fn gram_matrix(&self) -> CurvatureResult<Tensor> {
        self.announce("gram_matrix");
        let n = self.examples();
        let mut data = vec![0.0f32; n * n];
        self.gram_sweep(|block| {
            let cols = block.outer.len();
            let mirror = !block.is_diagonal();
            for (r, row) in block.inner.clone().enumerate() {
                for (c, col) in block.outer.clone().enumerate() {
                    let value = block.values.data()[r * cols + c];
                    data[row * n + col] = value;
                    if mirror {
                        data[col * n + row] = value;
                    }
                }
            }
            Ok(())
        })?;
        Ok(Tensor::from_vec(n, n, data)?)
    }

    /// `‖K‖_F` without holding more than one block.
    pub fn gram_frobenius_norm(&self) -> CurvatureResult<f64> {
        self.announce("gram_frobenius_norm");
        let mut squared = 0.0f64;
        self.gram_sweep(|block| {
            let weight = if block.is_diagonal() { 1.0 } else { 2.0 };
            squared += weight * block.values.squared_l2_norm();
            Ok(())
        })?;
        Ok(squared.sqrt())
    }
}
