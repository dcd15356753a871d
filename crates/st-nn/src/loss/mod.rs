// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod mean_squared_error;
mod softmax_cross_entropy;

use crate::{PureResult, Tensor, TensorError};

pub use mean_squared_error::MeanSquaredError;
pub use softmax_cross_entropy::SoftmaxCrossEntropy;

/// Losses that can report one value per example.
pub trait ExampleLoss {
    /// Unreduced losses, shape `(batch, 1)`.
    fn per_example(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;

    /// Gradient of the summed per-example losses with respect to the
    /// predictions. Row `i` only depends on example `i`.
    fn per_example_grad(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;
}

pub(crate) fn ensure_same_shape(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
    if prediction.shape() != target.shape() {
        return Err(TensorError::ShapeMismatch {
            left: prediction.shape(),
            right: target.shape(),
        });
    }
    Ok(())
}
