// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-query state shared with the layer hooks.

use std::cell::{Cell, RefCell, RefMut};
use std::ops::Range;
use std::rc::Rc;

use st_nn::{HookHandle, HookPoint, LayerHook};
use st_tensor::{PureResult, Tensor, TensorError};
use tracing::trace;

use super::kernel::LayerKernel;
use crate::error::{CurvatureError, CurvatureResult};

/// Which side of a two-pass sweep the current batch plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Outer,
    Inner,
}

/// Rows of the dataset covered by the batch being run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BatchWindow {
    pub offset: usize,
    pub rows: usize,
    pub phase: Phase,
}

impl BatchWindow {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.rows
    }
}

/// Accumulation step of one query, run from the post-backward hook of every
/// instrumented layer.
pub(crate) trait LayerSink {
    fn begin_batch(&mut self, _window: BatchWindow) -> CurvatureResult<()> {
        Ok(())
    }

    fn accumulate(
        &mut self,
        layer: usize,
        kernel: &LayerKernel,
        window: BatchWindow,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> CurvatureResult<()>;
}

/// Hook target of a query. Captures forward inputs keyed by layer index and
/// hands them, together with the output gradient, to the query's sink.
pub(crate) struct QueryContext<S> {
    kernels: Vec<LayerKernel>,
    window: Cell<Option<BatchWindow>>,
    inputs: RefCell<Vec<Option<Tensor>>>,
    completed: RefCell<Vec<bool>>,
    sink: RefCell<S>,
    failure: RefCell<Option<CurvatureError>>,
}

impl<S: LayerSink> QueryContext<S> {
    pub fn new(kernels: Vec<LayerKernel>, sink: S) -> Self {
        let layers = kernels.len();
        Self {
            kernels,
            window: Cell::new(None),
            inputs: RefCell::new(vec![None; layers]),
            completed: RefCell::new(vec![false; layers]),
            sink: RefCell::new(sink),
            failure: RefCell::new(None),
        }
    }

    pub fn begin_batch(&self, window: BatchWindow) -> CurvatureResult<()> {
        self.inputs.borrow_mut().iter_mut().for_each(|slot| *slot = None);
        self.completed.borrow_mut().fill(false);
        self.window.set(Some(window));
        self.sink.borrow_mut().begin_batch(window)
    }

    /// Every instrumented layer must have contributed to the batch.
    pub fn finish_batch(&self) -> CurvatureResult<()> {
        self.window.set(None);
        self.inputs.borrow_mut().iter_mut().for_each(|slot| *slot = None);
        let completed = self.completed.borrow();
        match completed.iter().position(|done| !done) {
            Some(layer) => Err(CurvatureError::Instrumentation {
                layer,
                message: "layer did not take part in the forward/backward pass".into(),
            }),
            None => Ok(()),
        }
    }

    /// Turns an error surfaced by the model back into the typed failure a
    /// hook recorded, if any.
    pub fn resolve(&self, err: TensorError) -> CurvatureError {
        self.failure.borrow_mut().take().unwrap_or(CurvatureError::Tensor(err))
    }

    pub fn sink_mut(&self) -> RefMut<'_, S> {
        self.sink.borrow_mut()
    }

    /// Reclaims the sink once every hook registration is gone.
    pub fn into_sink(self: Rc<Self>) -> CurvatureResult<S> {
        match Rc::try_unwrap(self) {
            Ok(context) => Ok(context.sink.into_inner()),
            Err(_) => Err(CurvatureError::Instrumentation {
                layer: 0,
                message: "hook registrations outlived their query".into(),
            }),
        }
    }

    fn fail(&self, layer: usize, err: CurvatureError) -> TensorError {
        let message = err.to_string();
        *self.failure.borrow_mut() = Some(err);
        TensorError::HookFailure { layer, message }
    }

    fn instrumentation(&self, layer: usize, message: &str) -> TensorError {
        self.fail(
            layer,
            CurvatureError::Instrumentation {
                layer,
                message: message.into(),
            },
        )
    }
}

impl<S: LayerSink> LayerHook for QueryContext<S> {
    fn pre_forward(&self, layer: usize, input: &Tensor) -> PureResult<()> {
        if self.window.get().is_none() {
            return Err(self.instrumentation(layer, "forward ran outside of a query batch"));
        }
        match self.inputs.borrow_mut().get_mut(layer) {
            Some(slot) => *slot = Some(input.clone()),
            None => return Err(self.instrumentation(layer, "unknown layer index")),
        }
        Ok(())
    }

    fn post_backward(&self, layer: usize, grad_output: &Tensor) -> PureResult<()> {
        let Some(window) = self.window.get() else {
            return Err(self.instrumentation(layer, "backward ran outside of a query batch"));
        };
        let (Some(kernel), captured) = (
            self.kernels.get(layer),
            self.inputs
                .borrow_mut()
                .get_mut(layer)
                .and_then(Option::take),
        ) else {
            return Err(self.instrumentation(layer, "unknown layer index"));
        };
        let Some(input) = captured else {
            return Err(self.instrumentation(
                layer,
                "backward fired without a captured forward input",
            ));
        };
        let result = self
            .sink
            .borrow_mut()
            .accumulate(layer, kernel, window, &input, grad_output);
        if let Err(err) = result {
            return Err(self.fail(layer, err));
        }
        if let Some(done) = self.completed.borrow_mut().get_mut(layer) {
            *done = true;
        }
        Ok(())
    }
}

/// Hook registrations of one query. Dropping the scope removes them all,
/// whichever way the query ends.
pub(crate) struct InstrumentationScope {
    handles: Vec<HookHandle>,
}

impl InstrumentationScope {
    /// Registers `hook` on every point, tagging point `i` with layer `i`.
    pub fn attach(points: &[&HookPoint], hook: Rc<dyn LayerHook>) -> Self {
        let handles = points
            .iter()
            .enumerate()
            .map(|(layer, point)| point.register(layer, Rc::clone(&hook)))
            .collect();
        Self { handles }
    }
}

impl Drop for InstrumentationScope {
    fn drop(&mut self) {
        trace!(hooks = self.handles.len(), "releasing curvature hooks");
    }
}
