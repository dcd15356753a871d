// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use common::*;
use st_curvature::{
    BlockDiagonal, CurvatureMatrix, Dense, Diagonal, EigenRoute, Generator, LowRank,
    RepresentationKind, Space,
};
use st_nn::{DataLoader, Dataset, MeanSquaredError, Module, SoftmaxCrossEntropy, Tensor};

struct Fixture {
    model: st_nn::Sequential,
    loader: DataLoader,
    loss: SoftmaxCrossEntropy,
}

impl Fixture {
    fn mlp(rows: usize, batch_size: usize, seed: u64) -> Self {
        let (inputs, targets) = classification(rows, 4, 3, seed);
        Self {
            model: small_mlp(),
            loader: loader(&inputs, &targets, batch_size),
            loss: SoftmaxCrossEntropy::new(),
        }
    }

    fn generator(&self, space: Space) -> Generator<'_> {
        Generator::new(&self.model, &self.loader, &self.loss, space).unwrap()
    }
}

fn check_agreement(generator: &Generator<'_>, kinds: &[RepresentationKind]) {
    let reference = Dense::new(generator).unwrap();
    let v = generator.vector(random_vector(generator.size(), 17)).unwrap();
    let expected_mv = reference.mv(&v).unwrap().to_flat();
    let expected_norm = reference.m_norm(&v).unwrap();
    let expected_trace = reference.trace().unwrap();
    let expected_frobenius = reference.frobenius_norm().unwrap();

    for &kind in kinds {
        let matrix = generator.represent(kind).unwrap();
        let mv = matrix.mv(&v).unwrap().to_flat();
        assert!(
            relative_error(&mv, &expected_mv) < 0.01,
            "{kind} mv in {} space",
            generator.space()
        );
        assert_relative_eq!(matrix.m_norm(&v).unwrap(), expected_norm, max_relative = 0.01);
        assert_relative_eq!(matrix.trace().unwrap(), expected_trace, max_relative = 0.01);
        assert_relative_eq!(
            matrix.frobenius_norm().unwrap(),
            expected_frobenius,
            max_relative = 0.01
        );
    }
}

#[test]
fn dense_low_rank_and_implicit_agree_in_both_spaces() {
    let fixture = Fixture::mlp(12, 5, 1);
    for space in [Space::Parameter, Space::Example] {
        check_agreement(
            &fixture.generator(space),
            &[RepresentationKind::LowRank, RepresentationKind::Implicit],
        );
    }
}

#[test]
fn structured_traces_match_dense() {
    let fixture = Fixture::mlp(12, 5, 2);
    let parameter = fixture.generator(Space::Parameter);
    let dense = parameter.represent(RepresentationKind::Dense).unwrap();
    for kind in [RepresentationKind::BlockDiagonal, RepresentationKind::Diagonal] {
        let matrix = parameter.represent(kind).unwrap();
        assert_relative_eq!(
            matrix.trace().unwrap(),
            dense.trace().unwrap(),
            max_relative = 0.01
        );
    }

    let example = fixture.generator(Space::Example);
    let gram = example.represent(RepresentationKind::Dense).unwrap();
    let diagonal = example.represent(RepresentationKind::Diagonal).unwrap();
    assert_relative_eq!(
        diagonal.trace().unwrap(),
        gram.trace().unwrap(),
        max_relative = 0.01
    );
}

#[test]
fn block_diagonal_keeps_dense_blocks_and_zeros_elsewhere() {
    let fixture = Fixture::mlp(10, 4, 3);
    let generator = fixture.generator(Space::Parameter);
    let dense = Dense::new(&generator).unwrap();
    let blocks = BlockDiagonal::new(&generator).unwrap();
    let full = dense.get_matrix().unwrap();
    let assembled = blocks.get_matrix().unwrap();
    let p = generator.parameters();
    assert_eq!(assembled.shape(), (p, p));
    let tolerance = 1e-5 * max_abs(&full).max(1.0);

    let slots = generator.layout().slots();
    let owner = |index: usize| slots.iter().position(|slot| slot.range().contains(&index));
    for i in 0..p {
        for j in 0..p {
            let value = assembled.data()[i * p + j];
            if owner(i) == owner(j) {
                assert_abs_diff_eq!(value, full.data()[i * p + j], epsilon = tolerance);
            } else {
                assert_eq!(value, 0.0, "entry ({i}, {j}) crosses layers");
            }
        }
    }

    let v = generator.vector(random_vector(p, 4)).unwrap();
    let expected = assembled.matvec(&v.to_flat()).unwrap();
    let mv = blocks.mv(&v).unwrap().to_flat();
    assert!(relative_error(&mv, &expected) < 1e-4);
    for (block, slot) in blocks.blocks().unwrap().iter().zip(slots) {
        assert_eq!(block.shape(), (slot.len(), slot.len()));
    }
}

#[test]
fn diagonal_matches_dense_diagonal() {
    let fixture = Fixture::mlp(11, 4, 4);
    for space in [Space::Parameter, Space::Example] {
        let generator = fixture.generator(space);
        let dense = Dense::new(&generator).unwrap();
        let diagonal = Diagonal::new(&generator).unwrap();
        let reference = dense.matrix().unwrap().diagonal().unwrap();
        assert!(relative_error(diagonal.values().unwrap(), &reference) < 1e-4);

        let v = random_vector(generator.size(), 5);
        let expected: f64 = reference
            .iter()
            .zip(&v)
            .map(|(&d, &x)| d as f64 * x as f64 * x as f64)
            .sum::<f64>()
            .sqrt();
        let vector = generator.vector(v).unwrap();
        assert_relative_eq!(
            diagonal.m_norm(&vector).unwrap(),
            expected,
            max_relative = 1e-4
        );
        let squared: f64 = reference.iter().map(|&d| d as f64 * d as f64).sum();
        assert_relative_eq!(
            diagonal.frobenius_norm().unwrap(),
            squared.sqrt(),
            max_relative = 1e-4
        );
    }
}

#[test]
fn diagonal_mv_multiplies_by_the_dense_diagonal() {
    let fixture = Fixture::mlp(11, 4, 10);
    for space in [Space::Parameter, Space::Example] {
        let generator = fixture.generator(space);
        let dense = Dense::new(&generator).unwrap();
        let diagonal = Diagonal::new(&generator).unwrap();
        let masked = Tensor::from_diagonal(&dense.matrix().unwrap().diagonal().unwrap()).unwrap();
        let v = generator.vector(random_vector(generator.size(), 11)).unwrap();
        let expected = masked.matvec(&v.to_flat()).unwrap();
        let mv = diagonal.mv(&v).unwrap().to_flat();
        assert!(relative_error(&mv, &expected) < 1e-4, "{space} space");
    }
}

#[test]
fn block_diagonal_norms_match_the_assembled_matrix() {
    let fixture = Fixture::mlp(10, 4, 12);
    let generator = fixture.generator(Space::Parameter);
    let blocks = BlockDiagonal::new(&generator).unwrap();
    let assembled = blocks.get_matrix().unwrap();

    let v = generator.vector(random_vector(generator.size(), 13)).unwrap();
    let flat = v.to_flat();
    let quadratic: f64 = assembled
        .matvec(&flat)
        .unwrap()
        .iter()
        .zip(&flat)
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum();
    assert_relative_eq!(
        blocks.m_norm(&v).unwrap(),
        quadratic.sqrt(),
        max_relative = 1e-4
    );
    assert_relative_eq!(
        blocks.frobenius_norm().unwrap(),
        assembled.squared_l2_norm().sqrt(),
        max_relative = 1e-4
    );
}

#[test]
fn projecting_the_low_rank_matrix_diagonalises_it() {
    let fixture = Fixture::mlp(12, 5, 14);
    for space in [Space::Parameter, Space::Example] {
        let generator = fixture.generator(space);
        for route in [EigenRoute::Svd, EigenRoute::Symmetric] {
            let mut low_rank = LowRank::new(&generator).unwrap();
            low_rank.compute_eigendecomposition(route).unwrap();
            let matrix = low_rank.get_matrix().unwrap();
            let projected = low_rank.project_matrix_to_diag(&matrix).unwrap();
            let eigen = low_rank.eigendecomposition().unwrap();
            let rank = eigen.rank();
            assert_eq!(projected.shape(), (rank, rank));
            let expected = Tensor::from_diagonal(eigen.eigenvalues()).unwrap();
            let largest = eigen.eigenvalues()[0];
            let diff = projected.max_abs_diff(&expected).unwrap();
            assert!(
                diff < 1e-3 * largest.max(1e-6),
                "{space} {route}: off by {diff}"
            );
        }
    }
}

#[test]
fn vanishing_gradients_give_a_rank_zero_low_rank_basis() {
    let model = small_mlp();
    let (inputs, _) = classification(8, 4, 3, 15);
    let targets = model.forward(&inputs).unwrap();
    let loader = Dataset::from_tensors(&inputs, &targets)
        .unwrap()
        .into_loader()
        .batched(3);
    let loss = MeanSquaredError::new();
    let generator = Generator::new(&model, &loader, &loss, Space::Parameter).unwrap();

    let dense = Dense::new(&generator).unwrap();
    assert_eq!(dense.eigendecomposition().unwrap().rank(), generator.size());
    for route in [EigenRoute::Svd, EigenRoute::Symmetric] {
        let mut low_rank = LowRank::new(&generator).unwrap();
        low_rank.compute_eigendecomposition(route).unwrap();
        let eigen = low_rank.eigendecomposition().unwrap();
        assert_eq!(eigen.rank(), 0);
        assert!(eigen.eigenvectors().is_none());
        assert_eq!(max_abs(&eigen.reconstruct().unwrap()), 0.0);
        let v = generator.vector(random_vector(generator.size(), 16)).unwrap();
        assert!(low_rank.project_to_diag(&v).unwrap().is_empty());
    }
}

#[test]
fn dense_eigenbasis_round_trips_and_reconstructs() {
    let fixture = Fixture::mlp(12, 5, 5);
    let generator = fixture.generator(Space::Parameter);
    let v = generator.vector(random_vector(generator.size(), 6)).unwrap();
    for route in [EigenRoute::Symmetric, EigenRoute::Svd] {
        let mut dense = Dense::new(&generator).unwrap();
        dense.compute_eigendecomposition(route).unwrap();
        let eigen = dense.eigendecomposition().unwrap();
        assert_eq!(eigen.route(), route);
        assert_eq!(eigen.rank(), generator.size());
        assert!(eigen
            .eigenvalues()
            .windows(2)
            .all(|pair| pair[0] >= pair[1]));

        let coordinates = dense.project_to_diag(&v).unwrap();
        let back = dense.project_from_diag(&coordinates).unwrap().to_flat();
        let diff = back
            .iter()
            .zip(v.to_flat())
            .fold(0.0f32, |acc, (&a, b)| acc.max((a - b).abs()));
        assert!(diff < 1e-4, "{route} round trip off by {diff}");

        let rebuilt = eigen.reconstruct().unwrap();
        assert!(rebuilt.max_abs_diff(dense.matrix().unwrap()).unwrap() < 1e-3);
    }
}

#[test]
fn projecting_the_matrix_diagonalises_it() {
    let fixture = Fixture::mlp(12, 5, 6);
    let generator = fixture.generator(Space::Example);
    let dense = Dense::new(&generator).unwrap();
    let matrix = dense.get_matrix().unwrap();
    let projected = dense.project_matrix_to_diag(&matrix).unwrap();
    let eigenvalues = dense.eigendecomposition().unwrap().eigenvalues().to_vec();
    let n = generator.size();
    let expected = Tensor::from_diagonal(&eigenvalues).unwrap();
    assert_eq!(projected.shape(), (n, n));
    let scale = eigenvalues[0].abs().max(1e-6);
    assert!(projected.max_abs_diff(&expected).unwrap() < 1e-4 * scale.max(1.0));
}

#[test]
fn low_rank_eigenpairs_satisfy_the_matrix() {
    let fixture = Fixture::mlp(12, 5, 7);
    for space in [Space::Parameter, Space::Example] {
        let generator = fixture.generator(space);
        let dense = Dense::new(&generator).unwrap();
        let matrix = dense.matrix().unwrap();
        for route in [EigenRoute::Svd, EigenRoute::Symmetric] {
            let mut low_rank = LowRank::new(&generator).unwrap();
            low_rank.compute_eigendecomposition(route).unwrap();
            let eigen = low_rank.eigendecomposition().unwrap();
            assert!(eigen.rank() <= generator.examples());
            let largest = eigen.eigenvalues()[0];
            let vectors = eigen.eigenvectors().unwrap();
            for (k, &lambda) in eigen.eigenvalues().iter().enumerate() {
                if lambda < 1e-3 * largest {
                    continue;
                }
                let u: Vec<f32> = (0..vectors.shape().0)
                    .map(|r| vectors.data()[r * vectors.shape().1 + k])
                    .collect();
                let mu = matrix.matvec(&u).unwrap();
                let residual = mu
                    .iter()
                    .zip(&u)
                    .map(|(&a, &b)| ((a - lambda * b) as f64).powi(2))
                    .sum::<f64>()
                    .sqrt();
                assert!(
                    residual < 1e-3 * largest as f64,
                    "{space} {route} pair {k}: residual {residual}"
                );
            }

            let coordinates: Vec<f32> = (0..eigen.rank()).map(|k| k as f32 - 1.5).collect();
            let vector = low_rank.project_from_diag(&coordinates).unwrap();
            let back = low_rank.project_to_diag(&vector).unwrap();
            for (&a, &b) in back.iter().zip(&coordinates) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-4 * coordinates.len() as f32);
            }
        }
    }
}

#[test]
fn low_rank_and_dense_share_leading_eigenvalues() {
    let fixture = Fixture::mlp(10, 3, 8);
    let generator = fixture.generator(Space::Parameter);
    let dense = Dense::new(&generator).unwrap();
    let low_rank = LowRank::new(&generator).unwrap();
    let full = dense.eigendecomposition().unwrap().eigenvalues();
    let thin = low_rank.eigendecomposition().unwrap().eigenvalues();
    let largest = full[0];
    for (&a, &b) in thin.iter().zip(full).take_while(|&(_, &b)| b > 1e-3 * largest) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-4 * largest);
    }
}

#[test]
fn representation_labels_round_trip() {
    let fixture = Fixture::mlp(6, 3, 9);
    let generator = fixture.generator(Space::Parameter);
    for kind in RepresentationKind::ALL {
        let matrix = generator.represent(kind).unwrap();
        assert_eq!(matrix.name(), kind.as_str());
        assert_eq!(kind.as_str().parse::<RepresentationKind>().unwrap(), kind);
        assert_eq!(matrix.size(), generator.parameters());
        assert_eq!(matrix.space(), Space::Parameter);
    }
}
