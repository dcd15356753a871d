// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use std::sync::Arc;

type Sample = (Tensor, Tensor);

/// In-memory dataset that keeps single-row input/target tensors paired.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dataset from an owning vector.
    pub fn from_vec(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Splits row-aligned `inputs` and `targets` into one sample per row.
    pub fn from_tensors(inputs: &Tensor, targets: &Tensor) -> PureResult<Self> {
        let rows = inputs.shape().0;
        if targets.shape().0 != rows {
            return Err(TensorError::ShapeMismatch {
                left: inputs.shape(),
                right: targets.shape(),
            });
        }
        let samples = (0..rows)
            .map(|r| Ok((inputs.slice_rows(r, r + 1)?, targets.slice_rows(r, r + 1)?)))
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self { samples })
    }

    /// Appends a new sample to the dataset.
    pub fn push(&mut self, input: Tensor, target: Tensor) {
        self.samples.push((input, target));
    }

    /// Returns the number of samples stored in the dataset.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no samples are registered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Consumes the dataset and turns it into a [`DataLoader`].
    pub fn into_loader(self) -> DataLoader {
        DataLoader::new(self.samples.into())
    }

    /// Loader over a copy of the samples.
    pub fn loader(&self) -> DataLoader {
        DataLoader::new(self.samples.clone().into())
    }
}

fn stack_batch(samples: &[Sample], indices: &[usize]) -> PureResult<(Tensor, Tensor)> {
    let (inputs, targets): (Vec<_>, Vec<_>) =
        indices.iter().map(|&idx| samples[idx].clone()).unzip();
    Ok((Tensor::cat_rows(&inputs)?, Tensor::cat_rows(&targets)?))
}

/// Iterator over mini-batches produced by a [`DataLoader`].
#[derive(Clone)]
pub struct DataLoaderBatches {
    samples: Arc<[Sample]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    position: usize,
}

impl Iterator for DataLoaderBatches {
    type Item = PureResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let start = self.position;
        let end = (start + self.batch_size).min(self.order.len());
        self.position = end;
        Some(stack_batch(&self.samples, &self.order[start..end]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.order.len().saturating_sub(self.position);
        let batches = remaining.div_ceil(self.batch_size);
        (batches, Some(batches))
    }
}

/// Restartable batch loader. The visiting order is fixed when the loader is
/// built, so every call to [`DataLoader::iter`] yields the same batches.
#[derive(Clone)]
pub struct DataLoader {
    samples: Arc<[Sample]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
}

impl core::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "DataLoader(samples={},batch_size={})",
            self.samples.len(),
            self.batch_size
        )
    }
}

impl DataLoader {
    fn new(samples: Arc<[Sample]>) -> Self {
        let len = samples.len();
        Self {
            samples,
            order: Arc::new((0..len).collect()),
            batch_size: 1,
        }
    }

    /// Returns the number of individual samples referenced by the loader.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per sweep; the last one may be short.
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Permutes the visiting order with a seeded shuffle.
    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        self.order = Arc::new(indices);
        self
    }

    /// Updates the loader to emit batches of `batch_size` samples.
    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Starts a fresh sweep over the configured batches.
    pub fn iter(&self) -> DataLoaderBatches {
        DataLoaderBatches {
            samples: Arc::clone(&self.samples),
            order: Arc::clone(&self.order),
            batch_size: self.batch_size,
            position: 0,
        }
    }
}

impl IntoIterator for &DataLoader {
    type Item = PureResult<(Tensor, Tensor)>;
    type IntoIter = DataLoaderBatches;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Dataset {
        Dataset::from_vec(
            (0..n)
                .map(|i| {
                    let input = Tensor::from_vec(1, 2, vec![i as f32, (i + 1) as f32]).unwrap();
                    let target = Tensor::from_vec(1, 1, vec![i as f32 * 2.0]).unwrap();
                    (input, target)
                })
                .collect(),
        )
    }

    #[test]
    fn loader_batches_rows_with_short_tail() {
        let loader = samples(7).into_loader().batched(3);
        assert_eq!(loader.num_batches(), 3);
        let shapes: Vec<_> = loader
            .iter()
            .map(|batch| batch.unwrap().0.shape())
            .collect();
        assert_eq!(shapes, vec![(3, 2), (3, 2), (1, 2)]);
        assert_eq!(loader.iter().size_hint(), (3, Some(3)));
    }

    #[test]
    fn loader_is_restartable() {
        let loader = samples(5).loader().shuffle(3).batched(2);
        let first: Vec<_> = loader.iter().map(|b| b.unwrap()).collect();
        let second: Vec<_> = (&loader).into_iter().map(|b| b.unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let loader = samples(6).loader().shuffle(11).batched(6);
        let (inputs, targets) = loader.iter().next().unwrap().unwrap();
        let mut firsts: Vec<f32> = (0..6).map(|r| inputs.row(r).unwrap()[0]).collect();
        for r in 0..6 {
            assert_eq!(targets.row(r).unwrap()[0], firsts[r] * 2.0);
        }
        firsts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(firsts, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn from_tensors_splits_rows() {
        let inputs = Tensor::from_fn(4, 3, |r, c| (r * 3 + c) as f32).unwrap();
        let targets = Tensor::from_fn(4, 1, |r, _| r as f32).unwrap();
        let dataset = Dataset::from_tensors(&inputs, &targets).unwrap();
        assert_eq!(dataset.len(), 4);
        let (x, _) = dataset.loader().batched(4).iter().next().unwrap().unwrap();
        assert_eq!(x, inputs);
        let short = Tensor::zeros(3, 1).unwrap();
        assert!(Dataset::from_tensors(&inputs, &short).is_err());
    }
}
