// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-example instrumentation of a model over a data loader.
//!
//! A [`Generator`] binds a model, a loader and an unreduced loss to one of the
//! two dual spaces. Every query re-runs forward/backward passes with hooks
//! attached to the supported layers and accumulates what it needs from the
//! captured inputs and output gradients; nothing survives the query except
//! the layer table built at construction.

mod context;
mod gram;
mod implicit;
pub mod kernel;
mod stats;

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use spiral_config::curvature::{self as curvature_config, CurvatureConfig};
use st_nn::{DataLoader, ExampleLoss, HookPoint, LayerHook, LayerInfo, Module};
use st_tensor::Tensor;
use tracing::{debug, info};

use crate::error::{CurvatureError, CurvatureResult};
use crate::layout::ParameterLayout;
use crate::vector::{Vector, VectorSpace};

use context::{BatchWindow, InstrumentationScope, LayerSink, Phase, QueryContext};
pub use kernel::LayerKernel;

/// The two dual spaces a curvature matrix can live in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Space {
    /// `G = (1/N) Σ g_i g_iᵀ`, one row per parameter.
    Parameter,
    /// `K[i, j] = g_i · g_j`, one row per example.
    Example,
}

impl Space {
    pub fn as_str(self) -> &'static str {
        match self {
            Space::Parameter => "parameter",
            Space::Example => "example",
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct KeptLayer<'a> {
    kernel: LayerKernel,
    hooks: &'a HookPoint,
}

pub struct Generator<'a> {
    model: &'a dyn Module,
    loader: &'a DataLoader,
    loss: &'a dyn ExampleLoss,
    space: Space,
    config: CurvatureConfig,
    layers: Vec<KeptLayer<'a>>,
    layout: Arc<ParameterLayout>,
}

impl fmt::Debug for Generator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Generator(space={},layers={},parameters={},examples={})",
            self.space,
            self.layers.len(),
            self.layout.total(),
            self.loader.len()
        )
    }
}

impl<'a> Generator<'a> {
    /// Walks the model, keeps the supported layers and checks that they own
    /// exactly the model's trainable parameters.
    pub fn new(
        model: &'a dyn Module,
        loader: &'a DataLoader,
        loss: &'a dyn ExampleLoss,
        space: Space,
    ) -> CurvatureResult<Self> {
        if let Some(device) = model.preferred_device() {
            return Err(CurvatureError::Configuration(format!(
                "model lives on '{device}' but curvature queries run on host memory"
            )));
        }
        if loader.is_empty() {
            return Err(CurvatureError::Configuration(
                "data loader yields no examples".into(),
            ));
        }

        let mut infos: Vec<LayerInfo<'a>> = Vec::new();
        model.visit_layers(&mut |info| {
            infos.push(info);
            Ok(())
        })?;

        let mut layers = Vec::new();
        let mut entries = Vec::new();
        let mut uncovered = Vec::new();
        for (position, info) in infos.into_iter().enumerate() {
            let name = display_name(info.name, position);
            let Some(spec) = info.spec else {
                if !info.parameter_shapes.is_empty() {
                    uncovered.push(name);
                }
                continue;
            };
            let kernel = LayerKernel::from_spec(spec)?;
            let Some(hooks) = info.hooks else {
                return Err(CurvatureError::Configuration(format!(
                    "layer '{name}' advertises an {} kind but exposes no hook point",
                    kernel.kind()
                )));
            };
            let expected = spec.parameter_shapes();
            if info.parameter_shapes != expected {
                return Err(CurvatureError::Configuration(format!(
                    "layer '{name}' owns parameters {:?} but its {} kind implies {expected:?}",
                    info.parameter_shapes,
                    kernel.kind()
                )));
            }
            layers.push(KeptLayer { kernel, hooks });
            entries.push((name, expected));
        }

        let layout = ParameterLayout::new(entries);
        let mut trainable = Vec::new();
        model.visit_parameters(&mut |param| {
            trainable.push(param.shape());
            Ok(())
        })?;
        if trainable != layout.parameter_shapes() {
            let culprits = if uncovered.is_empty() {
                String::new()
            } else {
                format!(
                    "; layers without a curvature formula own parameters: {}",
                    uncovered.join(", ")
                )
            };
            return Err(CurvatureError::Configuration(format!(
                "supported layers cover parameter shapes {:?} but the model trains {trainable:?}{culprits}",
                layout.parameter_shapes()
            )));
        }
        if layers.is_empty() {
            return Err(CurvatureError::Configuration(
                "model has no layer with a curvature formula".into(),
            ));
        }

        debug!(
            space = %space,
            layers = layers.len(),
            parameters = layout.total(),
            examples = loader.len(),
            batch_size = loader.batch_size(),
            "curvature generator ready"
        );
        Ok(Self {
            model,
            loader,
            loss,
            space,
            config: curvature_config::config().clone(),
            layers,
            layout: Arc::new(layout),
        })
    }

    /// Replaces the process-wide curvature defaults for this generator.
    pub fn with_config(mut self, config: CurvatureConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CurvatureConfig {
        &self.config
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn layout(&self) -> &Arc<ParameterLayout> {
        &self.layout
    }

    pub fn kernels(&self) -> Vec<LayerKernel> {
        self.layers.iter().map(|layer| layer.kernel).collect()
    }

    /// Number of training examples `N`.
    pub fn examples(&self) -> usize {
        self.loader.len()
    }

    /// Number of parameters `P` covered by the supported layers.
    pub fn parameters(&self) -> usize {
        self.layout.total()
    }

    /// Side length of the matrix in the bound space.
    pub fn size(&self) -> usize {
        match self.space {
            Space::Parameter => self.parameters(),
            Space::Example => self.examples(),
        }
    }

    pub fn vector_space(&self) -> VectorSpace {
        match self.space {
            Space::Parameter => VectorSpace::Parameters(Arc::clone(&self.layout)),
            Space::Example => VectorSpace::Examples(self.examples()),
        }
    }

    /// Vector of the bound space.
    pub fn vector(&self, data: Vec<f32>) -> CurvatureResult<Vector> {
        Vector::from_flat(self.vector_space(), data)
    }

    pub fn parameter_vector(&self, data: Vec<f32>) -> CurvatureResult<Vector> {
        Vector::from_flat(VectorSpace::Parameters(Arc::clone(&self.layout)), data)
    }

    pub fn example_vector(&self, data: Vec<f32>) -> CurvatureResult<Vector> {
        Vector::from_flat(VectorSpace::Examples(self.examples()), data)
    }

    /// Full matrix of the bound space.
    pub fn dense_matrix(&self) -> CurvatureResult<Tensor> {
        match self.space {
            Space::Parameter => self.parameter_matrix(),
            Space::Example => self.gram_matrix(),
        }
    }

    /// `M v` without a stored matrix.
    pub fn matrix_vector_product(&self, v: &[f32]) -> CurvatureResult<Vec<f32>> {
        match self.space {
            Space::Parameter => self.parameter_matrix_product(v),
            Space::Example => self.example_matrix_product(v),
        }
    }

    /// `sqrt(vᵀ M v)` in one pass: `‖J v‖ / √N` in parameter space and
    /// `‖Jᵀ v‖` in example space.
    pub fn m_norm(&self, v: &[f32]) -> CurvatureResult<f64> {
        match self.space {
            Space::Parameter => {
                let products = self.jacobian_product(v)?;
                let squared: f64 = products.iter().map(|p| p * p).sum();
                Ok((squared / self.examples() as f64).sqrt())
            }
            Space::Example => {
                let pulled = self.jacobian_transpose_product(v)?;
                Ok(pulled
                    .iter()
                    .map(|&x| x as f64 * x as f64)
                    .sum::<f64>()
                    .sqrt())
            }
        }
    }

    /// Trace in one pass from the per-example squared gradient norms.
    pub fn trace(&self) -> CurvatureResult<f64> {
        let total: f64 = self.squared_gradient_norms()?.iter().sum();
        Ok(match self.space {
            Space::Parameter => total / self.examples() as f64,
            Space::Example => total,
        })
    }

    /// Frobenius norm from the streamed Gram matrix; `‖G‖_F = ‖K‖_F / N`.
    pub fn frobenius_norm(&self) -> CurvatureResult<f64> {
        let gram = self.gram_frobenius_norm()?;
        Ok(match self.space {
            Space::Parameter => gram / self.examples() as f64,
            Space::Example => gram,
        })
    }

    /// Factor `W` with `M = W Wᵀ`: `Jᵀ/√N` in parameter space, `J` in example
    /// space.
    pub fn low_rank_factor(&self) -> CurvatureResult<Tensor> {
        let jacobian = self.jacobian()?;
        match self.space {
            Space::Parameter => {
                let scale = 1.0 / (self.examples() as f32).sqrt();
                Ok(jacobian.transpose().scale(scale)?)
            }
            Space::Example => Ok(jacobian),
        }
    }

    /// Diagonal of the bound space's matrix.
    pub fn diagonal(&self) -> CurvatureResult<Vec<f32>> {
        match self.space {
            Space::Parameter => self.parameter_diagonal(),
            Space::Example => Ok(self
                .squared_gradient_norms()?
                .into_iter()
                .map(|v| v as f32)
                .collect()),
        }
    }

    fn hook_points(&self) -> Vec<&'a HookPoint> {
        self.layers.iter().map(|layer| layer.hooks).collect()
    }

    /// One forward/backward pass over a batch, differentiating the summed
    /// per-example losses with respect to the inputs.
    fn run_batch<S: LayerSink>(
        &self,
        context: &QueryContext<S>,
        window: BatchWindow,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> CurvatureResult<()> {
        context.begin_batch(window)?;
        let output = self
            .model
            .forward(inputs)
            .map_err(|err| context.resolve(err))?;
        let grad = self.loss.per_example_grad(&output, targets)?;
        self.model
            .backward_input(inputs, &grad)
            .map_err(|err| context.resolve(err))?;
        context.finish_batch()
    }

    /// Single sweep over the loader with `sink` attached to every supported
    /// layer. `after_batch` sees the sink once each batch has finished.
    fn sweep<S, F>(&self, query: &'static str, sink: S, mut after_batch: F) -> CurvatureResult<S>
    where
        S: LayerSink + 'static,
        F: FnMut(&mut S, BatchWindow) -> CurvatureResult<()>,
    {
        let context = Rc::new(QueryContext::new(self.kernels(), sink));
        {
            let hook: Rc<dyn LayerHook> = context.clone();
            let _scope = InstrumentationScope::attach(&self.hook_points(), hook);
            let mut offset = 0;
            let mut batches = 0;
            for batch in self.loader.iter() {
                let (inputs, targets) = batch?;
                let window = BatchWindow {
                    offset,
                    rows: inputs.shape().0,
                    phase: Phase::Outer,
                };
                self.run_batch(&context, window, &inputs, &targets)?;
                after_batch(&mut *context.sink_mut(), window)?;
                offset += window.rows;
                batches += 1;
            }
            self.check_coverage(offset)?;
            debug!(query, space = %self.space, batches, "curvature sweep finished");
        }
        context.into_sink()
    }

    fn check_coverage(&self, seen: usize) -> CurvatureResult<()> {
        if seen != self.examples() {
            return Err(CurvatureError::Configuration(format!(
                "data loader yielded {seen} examples during a sweep but reports {}",
                self.examples()
            )));
        }
        Ok(())
    }

    pub(crate) fn announce(&self, query: &'static str) {
        info!(query, space = %self.space, size = self.size(), "curvature query");
    }
}

fn display_name(name: &str, index: usize) -> String {
    if name.is_empty() {
        format!("#{index}")
    } else {
        name.to_string()
    }
}
