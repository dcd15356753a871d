// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use st_nn::{
    Conv2d, ConvGeometry, DataLoader, Dataset, Linear, MaxPool2d, Module, Relu, Sequential,
    SoftmaxCrossEntropy, Tensor,
};

/// `4 -> 6 -> 3` classifier, 51 parameters.
pub fn small_mlp() -> Sequential {
    Sequential::new()
        .with(Linear::seeded("fc1", 4, 6, 11).unwrap())
        .with(Relu::new())
        .with(Linear::seeded("fc2", 6, 3, 12).unwrap())
}

/// `10 -> 25 -> 25 -> 10` classifier.
pub fn wide_mlp() -> Sequential {
    Sequential::new()
        .with(Linear::seeded("fc1", 10, 25, 21).unwrap())
        .with(Relu::new())
        .with(Linear::seeded("fc2", 25, 25, 22).unwrap())
        .with(Relu::new())
        .with(Linear::seeded("fc3", 25, 10, 23).unwrap())
}

/// Conv (1 -> 3, 3x3 on 6x6), relu, 2x2 max pool, linear head onto 4 classes.
pub fn small_convnet() -> Sequential {
    let geometry = ConvGeometry::new(1, 3, (3, 3), (6, 6)).unwrap();
    Sequential::new()
        .with(Conv2d::seeded("conv", geometry, 31).unwrap())
        .with(Relu::new())
        .with(MaxPool2d::new(3, (2, 2), (2, 2), (0, 0), (4, 4)).unwrap())
        .with(Linear::seeded("head", 12, 4, 32).unwrap())
}

/// `4 -> 6 -> 5 -> 3` classifier whose first and last layers carry no bias.
pub fn mixed_bias_mlp() -> Sequential {
    Sequential::new()
        .with(Linear::without_bias("fc1", 4, 6, 41).unwrap())
        .with(Relu::new())
        .with(Linear::seeded("fc2", 6, 5, 42).unwrap())
        .with(Relu::new())
        .with(Linear::without_bias("fc3", 5, 3, 43).unwrap())
}

/// [`small_convnet`] with a bias-free convolution.
pub fn mixed_bias_convnet() -> Sequential {
    let geometry = ConvGeometry::new(1, 3, (3, 3), (6, 6)).unwrap();
    Sequential::new()
        .with(Conv2d::without_bias("conv", geometry, 51).unwrap())
        .with(Relu::new())
        .with(MaxPool2d::new(3, (2, 2), (2, 2), (0, 0), (4, 4)).unwrap())
        .with(Linear::seeded("head", 12, 4, 52).unwrap())
}

/// Gaussian inputs with uniformly drawn class labels.
pub fn classification(
    rows: usize,
    features: usize,
    classes: usize,
    seed: u64,
) -> (Tensor, Tensor) {
    let inputs = Tensor::random_normal(rows, features, 0.0, 1.0, Some(seed)).unwrap();
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    let labels: Vec<usize> = (0..rows).map(|_| rng.gen_range(0..classes)).collect();
    let targets = SoftmaxCrossEntropy::one_hot(&labels, classes).unwrap();
    (inputs, targets)
}

pub fn loader(inputs: &Tensor, targets: &Tensor, batch_size: usize) -> DataLoader {
    Dataset::from_tensors(inputs, targets)
        .unwrap()
        .into_loader()
        .shuffle(3)
        .batched(batch_size)
}

pub fn random_vector(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub fn unit_vector(len: usize, seed: u64) -> Vec<f32> {
    let mut v = random_vector(len, seed);
    let norm = v.iter().map(|&x| x * x).sum::<f32>().sqrt();
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

/// `‖a - b‖ / ‖b‖`, with `b` the reference.
pub fn relative_error(a: &[f32], b: &[f32]) -> f64 {
    assert_eq!(a.len(), b.len());
    let diff: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| (x as f64 - y as f64).powi(2))
        .sum();
    let reference: f64 = b.iter().map(|&y| (y as f64).powi(2)).sum();
    (diff / reference.max(f64::MIN_POSITIVE)).sqrt()
}

pub fn max_abs(tensor: &Tensor) -> f32 {
    tensor.data().iter().fold(0.0f32, |acc, &x| acc.max(x.abs()))
}

/// Registered hooks across every layer of `model`.
pub fn active_hooks(model: &dyn Module) -> usize {
    let mut active = 0;
    model
        .visit_layers(&mut |info| {
            if let Some(hooks) = info.hooks {
                active += hooks.active();
            }
            Ok(())
        })
        .unwrap();
    active
}
