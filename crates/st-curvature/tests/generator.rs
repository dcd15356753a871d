// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod common;

use std::cell::Cell;

use approx::assert_relative_eq;
use common::*;
use st_curvature::{
    CurvatureConfig, CurvatureError, CurvatureMatrix, EigenRoute, Generator, RepresentationKind,
    Space, Vector,
};
use st_nn::{
    ExampleLoss, LayerInfo, Linear, Module, Parameter, PureResult, Relu, Scaler, Sequential,
    SoftmaxCrossEntropy, Tensor, TensorError,
};

fn per_example_losses(
    model: &dyn Module,
    loss: &dyn ExampleLoss,
    inputs: &Tensor,
    targets: &Tensor,
) -> Vec<f32> {
    let prediction = model.forward(inputs).unwrap();
    loss.per_example(&prediction, targets).unwrap().data().to_vec()
}

#[test]
fn layout_follows_trainable_parameters() {
    let model = small_mlp();
    let (inputs, targets) = classification(12, 4, 3, 1);
    let loader = loader(&inputs, &targets, 5);
    let loss = SoftmaxCrossEntropy::new();
    let generator = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap();

    let mut trainable = Vec::new();
    model
        .visit_parameters(&mut |param| {
            trainable.push(param.shape());
            Ok(())
        })
        .unwrap();
    assert_eq!(generator.layout().parameter_shapes(), trainable);
    assert_eq!(generator.parameters(), model.parameter_count().unwrap());
    assert_eq!(generator.kernels().len(), 2);
    let names: Vec<_> = generator
        .layout()
        .slots()
        .iter()
        .map(|slot| slot.name.clone())
        .collect();
    assert_eq!(names, vec!["fc1".to_string(), "fc2".to_string()]);
}

#[test]
fn gram_matrix_is_exactly_symmetric() {
    let model = small_convnet();
    let (inputs, targets) = classification(11, 36, 4, 2);
    let loader = loader(&inputs, &targets, 4);
    let loss = SoftmaxCrossEntropy::new();
    let generator = Generator::new(&model, &loader, &loss, Space::Example).unwrap();
    let gram = generator.dense_matrix().unwrap();
    let n = generator.examples();
    assert_eq!(gram.shape(), (n, n));
    let data = gram.data();
    for i in 0..n {
        for j in 0..i {
            assert_eq!(data[i * n + j], data[j * n + i], "entry ({i}, {j})");
        }
    }
}

#[test]
fn evicting_outer_batches_leaves_the_gram_unchanged() {
    let model = small_mlp();
    let (inputs, targets) = classification(13, 4, 3, 3);
    let loader = loader(&inputs, &targets, 4);
    let loss = SoftmaxCrossEntropy::new();
    let kept = CurvatureConfig {
        evict_outer: false,
        ..CurvatureConfig::default()
    };
    let evicted = CurvatureConfig {
        evict_outer: true,
        ..CurvatureConfig::default()
    };
    let a = Generator::new(&model, &loader, &loss, Space::Example)
        .unwrap()
        .with_config(kept)
        .dense_matrix()
        .unwrap();
    let b = Generator::new(&model, &loader, &loss, Space::Example)
        .unwrap()
        .with_config(evicted)
        .dense_matrix()
        .unwrap();
    assert_eq!(a, b);
}

/// Compares `dwᵀ G dw` with `(1/N) Σ_i (dℓ_i/dε)²`, the derivatives taken by
/// central differences of the per-example losses along `dw`.
fn check_finite_differences(mut model: Sequential, features: usize, classes: usize, seed: u64) {
    let (inputs, targets) = classification(12, features, classes, seed);
    let loader = loader(&inputs, &targets, 5);
    let loss = SoftmaxCrossEntropy::new();
    let dw = unit_vector(model.parameter_count().unwrap(), seed + 4);

    let quadratic = {
        let generator = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap();
        let dense = generator.represent(RepresentationKind::Dense).unwrap();
        let v = generator.vector(dw.clone()).unwrap();
        dense.m_norm(&v).unwrap().powi(2)
    };

    let eps = 1e-3f32;
    model.perturb_parameters(&dw, eps).unwrap();
    let plus = per_example_losses(&model, &loss, &inputs, &targets);
    model.perturb_parameters(&dw, -2.0 * eps).unwrap();
    let minus = per_example_losses(&model, &loss, &inputs, &targets);

    let n = inputs.shape().0 as f64;
    let estimate: f64 = plus
        .iter()
        .zip(&minus)
        .map(|(&p, &m)| ((p as f64 - m as f64) / (2.0 * eps as f64)).powi(2))
        .sum::<f64>()
        / n;
    assert_relative_eq!(estimate, quadratic, max_relative = 0.01);
}

#[test]
fn finite_differences_match_the_quadratic_form() {
    check_finite_differences(small_mlp(), 4, 3, 5);
}

#[test]
fn finite_differences_match_the_quadratic_form_through_conv_and_pooling() {
    check_finite_differences(small_convnet(), 36, 4, 15);
}

#[test]
fn finite_differences_match_the_quadratic_form_without_biases() {
    check_finite_differences(mixed_bias_mlp(), 4, 3, 25);
}

#[test]
fn bias_free_layers_shrink_the_layout() {
    let model = mixed_bias_mlp();
    let (inputs, targets) = classification(9, 4, 3, 13);
    let loader = loader(&inputs, &targets, 4);
    let loss = SoftmaxCrossEntropy::new();
    let generator = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap();
    assert_eq!(
        generator.layout().parameter_shapes(),
        vec![(4, 6), (6, 5), (1, 5), (5, 3)]
    );
    assert_eq!(generator.parameters(), 24 + 30 + 5 + 15);
    assert_eq!(generator.parameters(), model.parameter_count().unwrap());

    let data = random_vector(generator.parameters(), 14);
    let v = generator.vector(data.clone()).unwrap();
    let layers = v.to_layers().unwrap();
    let biases: Vec<_> = layers
        .iter()
        .map(|layer| layer.bias.as_ref().map(|bias| bias.shape()))
        .collect();
    assert_eq!(biases, vec![None, Some((1, 5)), None]);
    assert_eq!(layers[2].weight.shape(), (5, 3));
    let rebuilt = Vector::from_layers(generator.layout().clone(), layers).unwrap();
    assert_eq!(rebuilt.to_flat(), data);
}

#[test]
fn bias_free_gram_is_symmetric_and_matches_the_jacobian() {
    let model = mixed_bias_convnet();
    let (inputs, targets) = classification(11, 36, 4, 16);
    let loader = loader(&inputs, &targets, 4);
    let loss = SoftmaxCrossEntropy::new();
    let generator = Generator::new(&model, &loader, &loss, Space::Example).unwrap();
    let gram = generator.dense_matrix().unwrap();
    let n = generator.examples();
    let data = gram.data();
    for i in 0..n {
        for j in 0..i {
            assert_eq!(data[i * n + j], data[j * n + i], "entry ({i}, {j})");
        }
    }

    let jacobian = generator.low_rank_factor().unwrap();
    assert_eq!(jacobian.shape(), (n, 27 + 48 + 4));
    let expected = jacobian.matmul_transpose(&jacobian).unwrap();
    assert!(gram.max_abs_diff(&expected).unwrap() < 1e-4 * max_abs(&expected).max(1.0));
}

#[test]
fn bias_free_models_scale_by_the_number_of_examples() {
    let model = mixed_bias_mlp();
    let (inputs, targets) = classification(14, 4, 3, 17);
    let loader = loader(&inputs, &targets, 6);
    let loss = SoftmaxCrossEntropy::new();
    let parameter = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap();
    let example = Generator::new(&model, &loader, &loss, Space::Example).unwrap();
    let n = 14.0;
    assert_relative_eq!(
        example.trace().unwrap(),
        n * parameter.trace().unwrap(),
        max_relative = 0.01
    );
    assert_relative_eq!(
        example.frobenius_norm().unwrap(),
        n * parameter.frobenius_norm().unwrap(),
        max_relative = 0.01
    );

    for generator in [&parameter, &example] {
        let v = random_vector(generator.size(), 18);
        let dense = generator.dense_matrix().unwrap().matvec(&v).unwrap();
        let implicit = generator.matrix_vector_product(&v).unwrap();
        assert!(
            relative_error(&implicit, &dense) < 0.01,
            "{} space mv",
            generator.space()
        );
    }
    assert_eq!(active_hooks(&model), 0);
}

#[test]
fn example_space_scales_by_the_number_of_examples() {
    let model = small_mlp();
    let (inputs, targets) = classification(14, 4, 3, 6);
    let loader = loader(&inputs, &targets, 6);
    let loss = SoftmaxCrossEntropy::new();
    let parameter = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap();
    let example = Generator::new(&model, &loader, &loss, Space::Example).unwrap();
    let n = 14.0;

    assert_relative_eq!(
        example.trace().unwrap(),
        n * parameter.trace().unwrap(),
        max_relative = 0.01
    );
    assert_relative_eq!(
        example.frobenius_norm().unwrap(),
        n * parameter.frobenius_norm().unwrap(),
        max_relative = 0.01
    );
}

#[test]
fn frobenius_norm_matches_the_materialised_matrix() {
    let model = small_mlp();
    let (inputs, targets) = classification(10, 4, 3, 7);
    let loader = loader(&inputs, &targets, 3);
    let loss = SoftmaxCrossEntropy::new();
    for space in [Space::Parameter, Space::Example] {
        let generator = Generator::new(&model, &loader, &loss, space).unwrap();
        let matrix = generator.dense_matrix().unwrap();
        let squared = matrix.transpose().matmul(&matrix).unwrap().trace().unwrap();
        assert_relative_eq!(
            generator.frobenius_norm().unwrap(),
            squared.sqrt(),
            max_relative = 0.01
        );
    }
}

#[test]
fn hooks_are_released_after_successful_queries() {
    let model = small_mlp();
    let (inputs, targets) = classification(9, 4, 3, 8);
    let loader = loader(&inputs, &targets, 4);
    let loss = SoftmaxCrossEntropy::new();
    for space in [Space::Parameter, Space::Example] {
        let generator = Generator::new(&model, &loader, &loss, space).unwrap();
        let v = random_vector(generator.size(), 1);
        generator.trace().unwrap();
        generator.frobenius_norm().unwrap();
        generator.matrix_vector_product(&v).unwrap();
        generator.m_norm(&v).unwrap();
        generator.diagonal().unwrap();
        generator.low_rank_factor().unwrap();
        generator.dense_matrix().unwrap();
        assert_eq!(active_hooks(&model), 0, "{space} queries leaked hooks");
    }
}

/// Delegates to softmax cross-entropy and fails on the `fail_at`-th gradient
/// request.
struct FailingLoss {
    inner: SoftmaxCrossEntropy,
    calls: Cell<usize>,
    fail_at: usize,
}

impl ExampleLoss for FailingLoss {
    fn per_example(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        self.inner.per_example(prediction, target)
    }

    fn per_example_grad(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        if call == self.fail_at {
            return Err(TensorError::InvalidDimensions { rows: 0, cols: 0 });
        }
        self.inner.per_example_grad(prediction, target)
    }
}

#[test]
fn hooks_are_released_when_a_query_fails_midway() {
    let model = small_mlp();
    let (inputs, targets) = classification(12, 4, 3, 9);
    let loader = loader(&inputs, &targets, 4);
    let loss = FailingLoss {
        inner: SoftmaxCrossEntropy::new(),
        calls: Cell::new(0),
        fail_at: 2,
    };
    let generator = Generator::new(&model, &loader, &loss, Space::Example).unwrap();
    let err = generator.dense_matrix().unwrap_err();
    assert!(matches!(err, CurvatureError::Tensor(_)), "{err}");
    assert_eq!(active_hooks(&model), 0);

    // The generator stays usable once the loss recovers.
    assert!(generator.trace().unwrap() > 0.0);
    assert_eq!(active_hooks(&model), 0);
}

/// Reports its inner layer but never runs it.
struct Bypass {
    inner: Linear,
}

impl Module for Bypass {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(input.clone())
    }

    fn backward_input(&self, _input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        Ok(grad_output.clone())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters_mut(visitor)
    }

    fn visit_layers<'a>(
        &'a self,
        visitor: &mut dyn FnMut(LayerInfo<'a>) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_layers(visitor)
    }
}

#[test]
fn layers_that_never_run_are_instrumentation_errors() {
    let model = Sequential::new()
        .with(Linear::seeded("fc1", 4, 4, 1).unwrap())
        .with(Bypass {
            inner: Linear::seeded("skipped", 4, 4, 2).unwrap(),
        })
        .with(Relu::new())
        .with(Linear::seeded("fc2", 4, 3, 3).unwrap());
    let (inputs, targets) = classification(6, 4, 3, 10);
    let loader = loader(&inputs, &targets, 3);
    let loss = SoftmaxCrossEntropy::new();
    let generator = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap();
    let err = generator.trace().unwrap_err();
    assert!(
        matches!(err, CurvatureError::Instrumentation { layer: 1, .. }),
        "{err}"
    );
    assert_eq!(active_hooks(&model), 0);
}

#[test]
fn trainable_layers_without_formula_are_configuration_errors() {
    let model = Sequential::new()
        .with(Linear::seeded("fc1", 4, 6, 1).unwrap())
        .with(Scaler::new("gain", 6).unwrap())
        .with(Linear::seeded("fc2", 6, 3, 2).unwrap());
    let (inputs, targets) = classification(6, 4, 3, 11);
    let loader = loader(&inputs, &targets, 3);
    let loss = SoftmaxCrossEntropy::new();
    let err = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap_err();
    match err {
        CurvatureError::Configuration(message) => assert!(message.contains("gain"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unsupported_requests_are_reported() {
    let model = small_mlp();
    let (inputs, targets) = classification(8, 4, 3, 12);
    let loader = loader(&inputs, &targets, 4);
    let loss = SoftmaxCrossEntropy::new();

    let example = Generator::new(&model, &loader, &loss, Space::Example).unwrap();
    assert!(matches!(
        example.represent(RepresentationKind::BlockDiagonal),
        Err(CurvatureError::Unsupported { .. })
    ));
    let example_vector = example.vector(random_vector(8, 2)).unwrap();
    assert!(matches!(
        example_vector.to_layers(),
        Err(CurvatureError::Unsupported { .. })
    ));

    let parameter = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap();
    let mut implicit = parameter.represent(RepresentationKind::Implicit).unwrap();
    assert!(matches!(
        implicit.get_matrix(),
        Err(CurvatureError::Unsupported { .. })
    ));
    assert!(matches!(
        implicit.eigendecomposition(),
        Err(CurvatureError::Unsupported { .. })
    ));
    assert!(matches!(
        implicit.compute_eigendecomposition(EigenRoute::Symmetric),
        Err(CurvatureError::Unsupported { .. })
    ));
    assert!(matches!(
        implicit.mv(&example_vector),
        Err(CurvatureError::LayoutMismatch { .. })
    ));
    assert_eq!(active_hooks(&model), 0);
}
