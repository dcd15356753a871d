// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{ensure_same_shape, ExampleLoss};
use crate::{PureResult, Tensor};

/// Cross entropy on raw logits: a row-wise log-softmax followed by the
/// negative log-likelihood of the target distribution (usually one-hot).
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    /// Row-wise `log_softmax`, stabilised by the row maximum.
    pub fn log_softmax(logits: &Tensor) -> PureResult<Tensor> {
        let (rows, cols) = logits.shape();
        let mut out = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            let row = logits.row(r)?;
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum: f64 = row.iter().map(|&z| ((z - max) as f64).exp()).sum();
            let log_norm = max as f64 + sum.ln();
            out.extend(row.iter().map(|&z| (z as f64 - log_norm) as f32));
        }
        Tensor::from_vec(rows, cols, out)
    }

    /// One-hot encodes class indices into a `(labels.len(), classes)` tensor.
    pub fn one_hot(labels: &[usize], classes: usize) -> PureResult<Tensor> {
        Tensor::from_fn(labels.len(), classes, |r, c| {
            if labels[r] == c {
                1.0
            } else {
                0.0
            }
        })
    }
}

impl ExampleLoss for SoftmaxCrossEntropy {
    fn per_example(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        ensure_same_shape(prediction, target)?;
        let log_probs = Self::log_softmax(prediction)?;
        let rows = prediction.shape().0;
        let losses = log_probs
            .hadamard(target)?
            .sum_axis1()
            .into_iter()
            .map(|v| -v)
            .collect();
        Tensor::from_vec(rows, 1, losses)
    }

    fn per_example_grad(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        ensure_same_shape(prediction, target)?;
        let log_probs = Self::log_softmax(prediction)?;
        let (rows, cols) = prediction.shape();
        let mass = target.sum_axis1();
        let mut grad = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for (&lp, &t) in log_probs.row(r)?.iter().zip(target.row(r)?) {
                grad.push(lp.exp() * mass[r] - t);
            }
        }
        Tensor::from_vec(rows, cols, grad)
    }
}
