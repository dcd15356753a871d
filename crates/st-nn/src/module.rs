// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::hooks::HookPoint;
use crate::layers::conv::ConvGeometry;
use st_tensor::{PureResult, Tensor, TensorError};

/// Named trainable tensor.
pub struct Parameter {
    name: String,
    value: Tensor,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(f, "Parameter(name={},shape=({},{}))", self.name, rows, cols)
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    pub fn shape(&self) -> (usize, usize) {
        self.value.shape()
    }
}

/// Kind of computation a layer performs, for layers whose per-example
/// gradients have a closed form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum LayerSpec {
    /// `y = x W + b` with `W` stored as `(input_dim, output_dim)`.
    Affine {
        input_dim: usize,
        output_dim: usize,
        bias: bool,
    },
    /// 2-D convolution with weight `(out_channels, in_channels * kh * kw)`.
    Convolution { geometry: ConvGeometry, bias: bool },
}

impl LayerSpec {
    /// Parameter shapes the layer must own, weight first.
    pub fn parameter_shapes(&self) -> Vec<(usize, usize)> {
        let (weight, out, bias) = match *self {
            LayerSpec::Affine {
                input_dim,
                output_dim,
                bias,
            } => ((input_dim, output_dim), output_dim, bias),
            LayerSpec::Convolution { geometry, bias } => (
                (geometry.out_channels, geometry.kernel_span()),
                geometry.out_channels,
                bias,
            ),
        };
        let mut shapes = vec![weight];
        if bias {
            shapes.push((1, out));
        }
        shapes
    }

    /// Width of the layer's output rows.
    pub fn output_len(&self) -> usize {
        match *self {
            LayerSpec::Affine { output_dim, .. } => output_dim,
            LayerSpec::Convolution { geometry, .. } => geometry.output_len(),
        }
    }
}

/// A leaf layer as seen by [`Module::visit_layers`].
#[derive(Debug)]
pub struct LayerInfo<'a> {
    pub name: &'a str,
    pub spec: Option<LayerSpec>,
    pub hooks: Option<&'a HookPoint>,
    pub parameter_shapes: Vec<(usize, usize)>,
}

/// Minimal module trait mirroring `nn.Module`.
pub trait Module {
    /// Performs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates gradients to the input.
    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits all parameters owned by the module.
    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    /// Visits all parameters mutably.
    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        ""
    }

    /// Closed-form description of the layer, when it has one.
    fn layer_spec(&self) -> Option<LayerSpec> {
        None
    }

    /// Interception point fired around this layer's passes.
    fn hook_point(&self) -> Option<&HookPoint> {
        None
    }

    /// Device the module's tensors live on; `None` means host memory.
    fn preferred_device(&self) -> Option<&str> {
        None
    }

    /// Visits every leaf layer in traversal order. Containers override this to
    /// recurse into their children.
    fn visit_layers<'a>(
        &'a self,
        visitor: &mut dyn FnMut(LayerInfo<'a>) -> PureResult<()>,
    ) -> PureResult<()> {
        let mut parameter_shapes = Vec::new();
        self.visit_parameters(&mut |param| {
            parameter_shapes.push(param.shape());
            Ok(())
        })?;
        visitor(LayerInfo {
            name: self.name(),
            spec: self.layer_spec(),
            hooks: self.hook_point(),
            parameter_shapes,
        })
    }

    /// Total number of scalar parameters.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut total = 0;
        self.visit_parameters(&mut |param| {
            total += param.value().len();
            Ok(())
        })?;
        Ok(total)
    }

    /// Flattens all parameter values in visiting order.
    fn flat_parameters(&self) -> PureResult<Vec<f32>> {
        let mut flat = Vec::new();
        self.visit_parameters(&mut |param| {
            flat.extend_from_slice(param.value().data());
            Ok(())
        })?;
        Ok(flat)
    }

    /// Adds `scale * delta` to the parameters, `delta` being laid out as
    /// [`Module::flat_parameters`].
    fn perturb_parameters(&mut self, delta: &[f32], scale: f32) -> PureResult<()> {
        let expected = self.parameter_count()?;
        if delta.len() != expected {
            return Err(TensorError::DataLength {
                expected,
                got: delta.len(),
            });
        }
        let mut offset = 0;
        self.visit_parameters_mut(&mut |param| {
            let len = param.value().len();
            let slice = &delta[offset..offset + len];
            for (value, d) in param.value_mut().data_mut().iter_mut().zip(slice) {
                *value += scale * d;
            }
            offset += len;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;

    #[test]
    fn affine_spec_lists_parameter_shapes() {
        let spec = LayerSpec::Affine {
            input_dim: 3,
            output_dim: 2,
            bias: true,
        };
        assert_eq!(spec.parameter_shapes(), vec![(3, 2), (1, 2)]);
        assert_eq!(spec.output_len(), 2);
        let bare = LayerSpec::Affine {
            input_dim: 3,
            output_dim: 2,
            bias: false,
        };
        assert_eq!(bare.parameter_shapes(), vec![(3, 2)]);
    }

    #[test]
    fn perturbation_follows_visiting_order() {
        let mut layer = Linear::seeded("fc", 2, 2, 3).unwrap();
        let before = layer.flat_parameters().unwrap();
        assert_eq!(before.len(), layer.parameter_count().unwrap());
        let delta: Vec<f32> = (0..before.len()).map(|i| i as f32).collect();
        layer.perturb_parameters(&delta, 0.5).unwrap();
        let after = layer.flat_parameters().unwrap();
        for i in 0..before.len() {
            assert!((after[i] - before[i] - 0.5 * i as f32).abs() < 1e-6);
        }
        assert!(layer.perturb_parameters(&delta[..3], 1.0).is_err());
    }
}
