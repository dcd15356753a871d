// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neural module surface for SpiralTorch.
//!
//! Every [`Module`] runs a forward pass, propagates gradients to its input
//! ([`Module::backward_input`]) and describes its leaf layers
//! ([`Module::visit_layers`]). Affine and convolutional layers expose a
//! [`hooks::HookPoint`] so observers can see their inputs and output
//! gradients.

pub mod dataset;
pub mod hooks;
pub mod layers;
pub mod loss;
pub mod module;

pub use dataset::{DataLoader, Dataset};
pub use hooks::{HookHandle, HookPoint, LayerHook};
pub use layers::conv::{Conv2d, ConvGeometry, MaxPool2d};
pub use layers::linear::Linear;
pub use layers::sequential::Sequential;
pub use layers::{Relu, Scaler};
pub use loss::{ExampleLoss, MeanSquaredError, SoftmaxCrossEntropy};
pub use module::{LayerInfo, LayerSpec, Module, Parameter};

pub use st_tensor::{PureResult, Tensor, TensorError};
