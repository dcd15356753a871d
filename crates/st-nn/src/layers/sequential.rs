// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::cell::RefCell;

use crate::module::{LayerInfo, Module, Parameter};
use crate::{PureResult, Tensor};

/// Activations recorded by the latest forward pass.
struct ForwardTrace {
    input: Tensor,
    /// Output of every layer, last one included.
    activations: Vec<Tensor>,
}

/// Sequential container that mirrors `nn.Sequential`.
///
/// `forward` keeps its intermediate activations until the next backward call
/// with the same input consumes them, so a forward/backward pair runs every
/// layer's forward exactly once.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
    trace: RefCell<Option<ForwardTrace>>,
}

impl core::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sequential(num_layers={})", self.layers.len())
    }
}

impl Sequential {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new layer to the sequence.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    /// Builder-style [`Sequential::push`].
    pub fn with<M>(mut self, layer: M) -> Self
    where
        M: Module + 'static,
    {
        self.push(layer);
        self
    }

    /// Appends a pre-boxed module to the sequence.
    pub fn push_boxed(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    /// Returns the number of layers registered in the container.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` when the container does not hold any layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Whether a forward trace is waiting to be consumed.
    pub fn has_pending_trace(&self) -> bool {
        self.trace.borrow().is_some()
    }

    fn run_forward(&self, input: &Tensor) -> PureResult<Vec<Tensor>> {
        let mut activations = Vec::with_capacity(self.layers.len());
        let mut current = input.clone();
        for layer in &self.layers {
            current = layer.forward(&current)?;
            activations.push(current.clone());
        }
        Ok(activations)
    }

    /// Activations for `input`, taken from the pending trace when it matches
    /// and recomputed otherwise.
    fn activations_for(&self, input: &Tensor) -> PureResult<Vec<Tensor>> {
        let pending = self.trace.borrow_mut().take();
        match pending {
            Some(trace) if trace.input == *input => Ok(trace.activations),
            _ => self.run_forward(input),
        }
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.trace.borrow_mut().take();
        let activations = self.run_forward(input)?;
        let output = activations.last().cloned().unwrap_or_else(|| input.clone());
        *self.trace.borrow_mut() = Some(ForwardTrace {
            input: input.clone(),
            activations,
        });
        Ok(output)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let activations = self.activations_for(input)?;
        let mut grad = grad_output.clone();
        for (idx, layer) in self.layers.iter().enumerate().rev() {
            let layer_input = if idx == 0 {
                input
            } else {
                &activations[idx - 1]
            };
            grad = layer.backward_input(layer_input, &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn visit_layers<'a>(
        &'a self,
        visitor: &mut dyn FnMut(LayerInfo<'a>) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_layers(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::LayerHook;
    use crate::layers::{linear::Linear, Relu};
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Counter {
        forwards: Cell<usize>,
        backwards: Cell<usize>,
    }

    impl LayerHook for Counter {
        fn pre_forward(&self, _layer: usize, _input: &Tensor) -> PureResult<()> {
            self.forwards.set(self.forwards.get() + 1);
            Ok(())
        }

        fn post_backward(&self, _layer: usize, _grad: &Tensor) -> PureResult<()> {
            self.backwards.set(self.backwards.get() + 1);
            Ok(())
        }
    }

    fn model() -> Sequential {
        Sequential::new()
            .with(Linear::seeded("l1", 2, 3, 1).unwrap())
            .with(Relu::new())
            .with(Linear::seeded("l2", 3, 1, 2).unwrap())
    }

    #[test]
    fn sequential_forward_and_backward() {
        let seq = model();
        let input = Tensor::from_vec(1, 2, vec![0.5, -0.1]).unwrap();
        let output = seq.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 1));
        let grad_out = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let grad_input = seq.backward_input(&input, &grad_out).unwrap();
        assert_eq!(grad_input.shape(), (1, 2));
        let mut seen = 0;
        seq.visit_parameters(&mut |_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 4);
    }

    #[test]
    fn trace_avoids_second_forward() {
        let seq = model();
        let counter = Rc::new(Counter::default());
        let mut handles = Vec::new();
        seq.visit_layers(&mut |info| {
            if let Some(hooks) = info.hooks {
                handles.push(hooks.register(0, counter.clone()));
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(handles.len(), 2);

        let input = Tensor::from_vec(2, 2, vec![0.5, -0.1, 1.0, 2.0]).unwrap();
        let out = seq.forward(&input).unwrap();
        assert!(seq.has_pending_trace());
        seq.backward_input(&input, &out).unwrap();
        assert!(!seq.has_pending_trace());
        assert_eq!(counter.forwards.get(), 2);
        assert_eq!(counter.backwards.get(), 2);

        // A backward without a matching forward recomputes activations.
        let other = Tensor::from_vec(2, 2, vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        seq.backward_input(&other, &out).unwrap();
        assert_eq!(counter.forwards.get(), 4);
        drop(handles);
    }

    #[test]
    fn visit_layers_reports_leaves_in_order() {
        let seq = model();
        let mut names = Vec::new();
        seq.visit_layers(&mut |info| {
            names.push((info.name.to_string(), info.spec.is_some()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            names,
            vec![
                ("l1".to_string(), true),
                (String::new(), false),
                ("l2".to_string(), true)
            ]
        );
    }
}
