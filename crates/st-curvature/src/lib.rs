// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Curvature matrices of SpiralTorch models.
//!
//! A [`Generator`] instruments a [`st_nn::Module`] layer by layer and turns
//! per-example gradients into the quantities a curvature representation
//! needs, in parameter space (`G = (1/N) Σ g_i g_iᵀ`) or example space
//! (`K[i, j] = g_i · g_j`). The representations in [`representation`] share
//! the [`CurvatureMatrix`] algebra.
//!
//! ```no_run
//! use st_curvature::{CurvatureMatrix, Generator, RepresentationKind, Space};
//! use st_nn::{Dataset, Linear, Relu, Sequential, SoftmaxCrossEntropy, Tensor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = Sequential::new()
//!     .with(Linear::seeded("fc1", 4, 8, 1)?)
//!     .with(Relu::new())
//!     .with(Linear::seeded("fc2", 8, 3, 2)?);
//! let inputs = Tensor::random_normal(12, 4, 0.0, 1.0, Some(7))?;
//! let targets = SoftmaxCrossEntropy::one_hot(&[0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2], 3)?;
//! let loader = Dataset::from_tensors(&inputs, &targets)?.into_loader().batched(4);
//! let loss = SoftmaxCrossEntropy::new();
//!
//! let generator = Generator::new(&model, &loader, &loss, Space::Parameter)?;
//! let fisher = generator.represent(RepresentationKind::LowRank)?;
//! println!("trace = {}", fisher.trace()?);
//! # Ok(())
//! # }
//! ```

pub mod eigen;
pub mod error;
pub mod generator;
pub mod layout;
pub mod representation;
pub mod telemetry;
pub mod vector;

pub use eigen::Eigendecomposition;
pub use error::{CurvatureError, CurvatureResult};
pub use generator::{Generator, LayerKernel, Space};
pub use layout::{LayerSlot, ParameterLayout};
pub use representation::{
    BlockDiagonal, CurvatureMatrix, Dense, Diagonal, Implicit, LowRank, RepresentationKind,
};
pub use spiral_config::curvature::{CurvatureConfig, EigenRoute};
pub use vector::{LayerComponents, Vector, VectorSpace};
