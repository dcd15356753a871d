// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{ensure_same_shape, ExampleLoss};
use crate::{PureResult, Tensor};

/// Squared error; the per-example loss sums the squared residuals of one row.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    /// Creates a new mean squared error loss instance.
    pub fn new() -> Self {
        Self
    }
}

impl ExampleLoss for MeanSquaredError {
    fn per_example(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        ensure_same_shape(prediction, target)?;
        let diff = prediction.sub(target)?;
        let rows = diff.shape().0;
        let losses = diff.hadamard(&diff)?.sum_axis1();
        Tensor::from_vec(rows, 1, losses)
    }

    fn per_example_grad(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        ensure_same_shape(prediction, target)?;
        prediction.sub(target)?.scale(2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_targets_are_rejected() {
        let loss = MeanSquaredError::new();
        let prediction = Tensor::from_vec(1, 3, vec![0.5, -0.5, 1.0]).unwrap();
        let target = Tensor::zeros(1, 2).unwrap();
        assert!(loss.per_example(&prediction, &target).is_err());
        assert!(loss.per_example_grad(&prediction, &target).is_err());
    }

    #[test]
    fn per_example_values_stay_row_local() {
        let loss = MeanSquaredError::new();
        let prediction = Tensor::from_vec(2, 2, vec![1.0, 1.0, 0.0, 3.0]).unwrap();
        let target = Tensor::zeros(2, 2).unwrap();
        let values = loss.per_example(&prediction, &target).unwrap();
        assert_eq!(values.shape(), (2, 1));
        assert_eq!(values.data(), &[2.0, 9.0]);
        let grad = loss.per_example_grad(&prediction, &target).unwrap();
        assert_eq!(grad.data(), &[2.0, 2.0, 0.0, 6.0]);
    }
}
