// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Leading Fisher eigenvalues of a small classifier, next to the trace and
//! Frobenius norm reported by each representation.
//!
//! Run with `SPIRAL_LOG=debug` to follow the sweeps.

use st_curvature::{telemetry, CurvatureMatrix, Generator, RepresentationKind, Space};
use st_nn::{Dataset, Linear, Relu, Sequential, SoftmaxCrossEntropy, Tensor};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing();

    let model = Sequential::new()
        .with(Linear::seeded("fc1", 8, 16, 1)?)
        .with(Relu::new())
        .with(Linear::seeded("fc2", 16, 4, 2)?);
    let rows = 64;
    let inputs = Tensor::random_normal(rows, 8, 0.0, 1.0, Some(7))?;
    let labels: Vec<usize> = (0..rows).map(|i| (i * 7 + 3) % 4).collect();
    let targets = SoftmaxCrossEntropy::one_hot(&labels, 4)?;
    let loader = Dataset::from_tensors(&inputs, &targets)?
        .into_loader()
        .shuffle(11)
        .batched(16);
    let loss = SoftmaxCrossEntropy::new();

    for space in [Space::Parameter, Space::Example] {
        let generator = Generator::new(&model, &loader, &loss, space)?;
        println!("{space} space, size {}", generator.size());
        for kind in RepresentationKind::ALL {
            let matrix = match generator.represent(kind) {
                Ok(matrix) => matrix,
                Err(err) => {
                    println!("  {kind:<10} skipped: {err}");
                    continue;
                }
            };
            println!(
                "  {kind:<10} trace {:>10.5}  frobenius {:>10.5}",
                matrix.trace()?,
                matrix.frobenius_norm()?
            );
        }
        let low_rank = generator.represent(RepresentationKind::LowRank)?;
        let eigen = low_rank.eigendecomposition()?;
        let leading: Vec<String> = eigen
            .eigenvalues()
            .iter()
            .take(5)
            .map(|v| format!("{v:.4}"))
            .collect();
        println!("  leading eigenvalues: {}", leading.join(", "));
    }

    telemetry::flush();
    Ok(())
}
