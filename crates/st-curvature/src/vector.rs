// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Points of parameter space and example space.
//!
//! A parameter-space [`Vector`] can be stored flat or split per layer; both
//! layouts are derived from the same [`ParameterLayout`] and convert without
//! loss. Example-space vectors only exist in flat form.

use std::borrow::Cow;
use std::sync::Arc;

use st_tensor::Tensor;

use crate::error::{CurvatureError, CurvatureResult};
use crate::layout::ParameterLayout;

/// Weight and optional bias of one supported layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerComponents {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

/// Space a vector lives in.
#[derive(Clone, Debug, PartialEq)]
pub enum VectorSpace {
    Parameters(Arc<ParameterLayout>),
    /// One coordinate per training example.
    Examples(usize),
}

impl VectorSpace {
    pub fn len(&self) -> usize {
        match self {
            VectorSpace::Parameters(layout) => layout.total(),
            VectorSpace::Examples(count) => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn describe(&self) -> String {
        match self {
            VectorSpace::Parameters(layout) => format!(
                "parameter space ({} layers, {} entries)",
                layout.len(),
                layout.total()
            ),
            VectorSpace::Examples(count) => format!("example space ({count} entries)"),
        }
    }

    fn compatible(&self, other: &VectorSpace) -> bool {
        match (self, other) {
            (VectorSpace::Parameters(a), VectorSpace::Parameters(b)) => {
                Arc::ptr_eq(a, b) || a == b
            }
            (VectorSpace::Examples(a), VectorSpace::Examples(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
enum Storage {
    Flat(Vec<f32>),
    Layers(Vec<LayerComponents>),
}

#[derive(Clone, Debug)]
pub struct Vector {
    space: VectorSpace,
    storage: Storage,
}

impl Vector {
    /// Wraps a flat array, checking its length against `space`.
    pub fn from_flat(space: VectorSpace, data: Vec<f32>) -> CurvatureResult<Self> {
        if data.len() != space.len() {
            return Err(CurvatureError::LayoutMismatch {
                expected: space.describe(),
                got: format!("{} entries", data.len()),
            });
        }
        Ok(Self {
            space,
            storage: Storage::Flat(data),
        })
    }

    /// Example-space vector of length `data.len()`.
    pub fn examples(data: Vec<f32>) -> Self {
        Self {
            space: VectorSpace::Examples(data.len()),
            storage: Storage::Flat(data),
        }
    }

    /// Builds a parameter-space vector from one entry per laid-out layer.
    pub fn from_layers(
        layout: Arc<ParameterLayout>,
        components: Vec<LayerComponents>,
    ) -> CurvatureResult<Self> {
        if components.len() != layout.len() {
            return Err(CurvatureError::LayoutMismatch {
                expected: format!("{} layers", layout.len()),
                got: format!("{} layers", components.len()),
            });
        }
        for (slot, component) in layout.slots().iter().zip(&components) {
            let bias_shape = component.bias.as_ref().map(Tensor::shape);
            if component.weight.shape() != slot.weight_shape || bias_shape != slot.bias_shape {
                return Err(CurvatureError::LayoutMismatch {
                    expected: format!(
                        "layer '{}' with weight {:?} and bias {:?}",
                        slot.name, slot.weight_shape, slot.bias_shape
                    ),
                    got: format!("weight {:?} and bias {:?}", component.weight.shape(), bias_shape),
                });
            }
        }
        Ok(Self {
            space: VectorSpace::Parameters(layout),
            storage: Storage::Layers(components),
        })
    }

    pub fn space(&self) -> &VectorSpace {
        &self.space
    }

    pub fn len(&self) -> usize {
        self.space.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat view, concatenating per-layer storage on demand.
    pub(crate) fn flat(&self) -> Cow<'_, [f32]> {
        match &self.storage {
            Storage::Flat(data) => Cow::Borrowed(data),
            Storage::Layers(components) => {
                let mut data = Vec::with_capacity(self.len());
                for component in components {
                    data.extend_from_slice(component.weight.data());
                    if let Some(bias) = &component.bias {
                        data.extend_from_slice(bias.data());
                    }
                }
                Cow::Owned(data)
            }
        }
    }

    pub fn to_flat(&self) -> Vec<f32> {
        self.flat().into_owned()
    }

    /// Splits the vector per layer. Example-space vectors have no per-layer
    /// form.
    pub fn to_layers(&self) -> CurvatureResult<Vec<LayerComponents>> {
        let layout = match &self.space {
            VectorSpace::Parameters(layout) => layout,
            VectorSpace::Examples(_) => {
                return Err(CurvatureError::unsupported(
                    "to_layers",
                    "example-space vectors",
                ))
            }
        };
        if let Storage::Layers(components) = &self.storage {
            return Ok(components.clone());
        }
        let flat = self.flat();
        layout
            .slots()
            .iter()
            .map(|slot| {
                let (rows, cols) = slot.weight_shape;
                let weight_end = slot.offset + slot.weight_len();
                let weight = Tensor::from_vec(rows, cols, flat[slot.offset..weight_end].to_vec())?;
                let bias = match slot.bias_shape {
                    Some((rows, cols)) => Some(Tensor::from_vec(
                        rows,
                        cols,
                        flat[weight_end..weight_end + slot.bias_len()].to_vec(),
                    )?),
                    None => None,
                };
                Ok(LayerComponents { weight, bias })
            })
            .collect()
    }

    /// Euclidean inner product, accumulated in `f64`.
    pub fn dot(&self, other: &Vector) -> CurvatureResult<f64> {
        if self.len() != other.len() {
            return Err(CurvatureError::length(self.len(), other.len()));
        }
        Ok(self
            .flat()
            .iter()
            .zip(other.flat().iter())
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum())
    }

    pub fn norm(&self) -> f64 {
        self.flat()
            .iter()
            .map(|&v| v as f64 * v as f64)
            .sum::<f64>()
            .sqrt()
    }

    /// Fails unless the vector belongs to `space`.
    pub(crate) fn expect_space(&self, space: &VectorSpace) -> CurvatureResult<()> {
        if self.space.compatible(space) {
            return Ok(());
        }
        Err(CurvatureError::LayoutMismatch {
            expected: space.describe(),
            got: self.space.describe(),
        })
    }
}
