// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::hooks::HookPoint;
use crate::module::{LayerSpec, Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Fully-connected layer, `y = x W + b`, the bias being optional.
#[derive(Debug)]
pub struct Linear {
    name: String,
    weight: Parameter,
    bias: Option<Parameter>,
    hooks: HookPoint,
}

impl Linear {
    /// Creates a new linear layer with weights drawn uniformly from
    /// `±1/sqrt(input_dim)`. Seeding follows the process determinism policy.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        Self::init(name.into(), input_dim, output_dim, None)
    }

    /// Same as [`Linear::new`] with an explicit seed.
    pub fn seeded(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        seed: u64,
    ) -> PureResult<Self> {
        Self::init(name.into(), input_dim, output_dim, Some(seed))
    }

    /// Seeded layer computing `y = x W` with no bias parameter.
    pub fn without_bias(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        seed: u64,
    ) -> PureResult<Self> {
        let mut layer = Self::init(name.into(), input_dim, output_dim, Some(seed))?;
        layer.bias = None;
        Ok(layer)
    }

    fn init(
        name: String,
        input_dim: usize,
        output_dim: usize,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let bound = 1.0 / (input_dim as f32).sqrt();
        let weight = Tensor::random_uniform(input_dim, output_dim, -bound, bound, seed)?;
        let bias = Tensor::random_uniform(
            1,
            output_dim,
            -bound,
            bound,
            seed.map(|s| s.wrapping_add(1)),
        )?;
        Self::from_parts(name, weight, Some(bias))
    }

    /// Builds the layer around an explicit weight `(input_dim, output_dim)`
    /// and an optional bias `(1, output_dim)`.
    pub fn from_parts(
        name: impl Into<String>,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> PureResult<Self> {
        let (_, output_dim) = weight.shape();
        if let Some(bias) = &bias {
            if bias.shape() != (1, output_dim) {
                return Err(TensorError::ShapeMismatch {
                    left: bias.shape(),
                    right: (1, output_dim),
                });
            }
        }
        let name = name.into();
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: bias.map(|bias| Parameter::new(format!("{name}::bias"), bias)),
            name,
            hooks: HookPoint::new(),
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns the bias parameter, if the layer has one.
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn check_grad(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<()> {
        let expected = (input.shape().0, self.weight.shape().1);
        if grad_output.shape() != expected {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: expected,
            });
        }
        Ok(())
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        self.hooks.fire_pre_forward(input)?;
        let mut out = input.matmul(self.weight.value())?;
        if let Some(bias) = &self.bias {
            out.add_row_inplace(bias.value().data())?;
        }
        Ok(out)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.check_grad(input, grad_output)?;
        self.hooks.fire_post_backward(grad_output)?;
        grad_output.matmul_transpose(self.weight.value())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn layer_spec(&self) -> Option<LayerSpec> {
        let (input_dim, output_dim) = self.weight.shape();
        Some(LayerSpec::Affine {
            input_dim,
            output_dim,
            bias: self.bias.is_some(),
        })
    }

    fn hook_point(&self) -> Option<&HookPoint> {
        Some(&self.hooks)
    }
}
