// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Feature-wise gain layer. Its parameter is trainable but the layer
/// advertises no [`crate::module::LayerSpec`].
#[derive(Debug)]
pub struct Scaler {
    name: String,
    gain: Parameter,
}

impl Scaler {
    /// Creates a new scaler layer with unit gain for every feature.
    pub fn new(name: impl Into<String>, features: usize) -> PureResult<Self> {
        if features == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: features,
            });
        }
        Self::from_gain(name, Tensor::from_vec(1, features, vec![1.0; features])?)
    }

    /// Constructs a scaler from an explicit `(1, features)` gain tensor.
    pub fn from_gain(name: impl Into<String>, gain: Tensor) -> PureResult<Self> {
        let (rows, cols) = gain.shape();
        if rows != 1 {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (1, cols),
            });
        }
        let name = name.into();
        Ok(Self {
            gain: Parameter::new(format!("{name}::gain"), gain),
            name,
        })
    }

    pub fn gain(&self) -> &Parameter {
        &self.gain
    }

    fn check(&self, input: &Tensor) -> PureResult<()> {
        let gain = self.gain.shape();
        if gain.1 != input.shape().1 {
            return Err(TensorError::ShapeMismatch {
                left: gain,
                right: (1, input.shape().1),
            });
        }
        Ok(())
    }
}

impl Module for Scaler {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.check(input)?;
        let gain = self.gain.value().data();
        let cols = input.shape().1;
        let mut output = input.clone();
        for (i, value) in output.data_mut().iter_mut().enumerate() {
            *value *= gain[i % cols];
        }
        Ok(output)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        self.check(input)?;
        let gain = self.gain.value().data();
        let cols = input.shape().1;
        let mut grad_input = grad_output.clone();
        for (i, value) in grad_input.data_mut().iter_mut().enumerate() {
            *value *= gain[i % cols];
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gain)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gain)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaler_scales_features() {
        let gain = Tensor::from_vec(1, 2, vec![2.0, -1.0]).unwrap();
        let layer = Scaler::from_gain("gain", gain).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = layer.forward(&input).unwrap();
        assert_eq!(out.data(), &[2.0, -2.0, 6.0, -4.0]);
        let grad = Tensor::from_vec(2, 2, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let grad_input = layer.backward_input(&input, &grad).unwrap();
        assert_eq!(grad_input.data(), &[2.0, -1.0, 2.0, -1.0]);
        assert!(layer.layer_spec().is_none());
    }
}
