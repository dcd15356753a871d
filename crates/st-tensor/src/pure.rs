// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust 2D tensors with only lightweight external dependencies.
//!
//! Everything is row-major `f32` on the host. Matrix products split their
//! output rows across the Rayon pool once the problem is large enough; every
//! output row is reduced on a single thread, so results never depend on the
//! pool size.

use core::fmt;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use rayon::{current_num_threads, prelude::*};
use spiral_config::determinism;
use std::error::Error;
use std::sync::Arc;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities and the modules built on them.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
    /// A row or element index fell outside the tensor.
    IndexOutOfBounds {
        label: &'static str,
        index: usize,
        len: usize,
    },
    /// Attempted to load or update a parameter that does not exist.
    MissingParameter { name: String },
    /// Numeric guard detected a non-finite value.
    NonFiniteValue { label: &'static str, value: f32 },
    /// A hook attached to a layer rejected the values it observed.
    HookFailure { layer: usize, message: String },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
            TensorError::IndexOutOfBounds { label, index, len } => {
                write!(f, "{label} index {index} is out of bounds for length {len}")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}'")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value detected for {label}: {value}")
            }
            TensorError::HookFailure { layer, message } => {
                write!(f, "hook on layer {layer} failed: {message}")
            }
        }
    }
}

impl Error for TensorError {}

/// Products below this many multiply-adds stay on the calling thread.
const PARALLEL_GEMM_THRESHOLD: usize = 1 << 16;

/// A simple 2D row-major tensor backed by a reference-counted buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    fn from_parts(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data: Arc::new(data),
            rows,
            cols,
        })
    }

    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::from_parts(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// reproducible. Otherwise the process determinism policy decides.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = Self::seedable_rng(seed, "st-tensor/tensor/uniform");
        let distribution = Uniform::new(min, max);
        let data = (0..rows * cols)
            .map(|_| distribution.sample(&mut rng))
            .collect();
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = Self::seedable_rng(seed, "st-tensor/tensor/normal");
        let data = (0..rows * cols)
            .map(|_| {
                let sample: f64 = StandardNormal.sample(&mut rng);
                mean + std * sample as f32
            })
            .collect();
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::from_parts(rows, cols, data)
    }

    /// The `n x n` identity.
    pub fn identity(n: usize) -> PureResult<Self> {
        Self::from_fn(n, n, |r, c| if r == c { 1.0 } else { 0.0 })
    }

    /// Square matrix with `values` on the diagonal.
    pub fn from_diagonal(values: &[f32]) -> PureResult<Self> {
        if values.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::from_diagonal"));
        }
        let n = values.len();
        let mut data = vec![0.0; n * n];
        for (i, &value) in values.iter().enumerate() {
            data[i * n + i] = value;
        }
        Self::from_parts(n, n, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Returns a read-only view of the underlying buffer.
    pub fn data(&self) -> &[f32] {
        self.data.as_slice()
    }

    /// Returns a mutable view, cloning the buffer first if it is shared.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Copies the buffer out.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.as_ref().clone()
    }

    /// Borrow a single row.
    pub fn row(&self, index: usize) -> PureResult<&[f32]> {
        if index >= self.rows {
            return Err(TensorError::IndexOutOfBounds {
                label: "row",
                index,
                len: self.rows,
            });
        }
        let start = index * self.cols;
        Ok(&self.data[start..start + self.cols])
    }

    /// Copies rows `start..end` into a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if end > self.rows {
            return Err(TensorError::IndexOutOfBounds {
                label: "slice_rows",
                index: end,
                len: self.rows,
            });
        }
        if start >= end {
            return Err(TensorError::EmptyInput("Tensor::slice_rows"));
        }
        let data = self.data[start * self.cols..end * self.cols].to_vec();
        Tensor::from_parts(end - start, self.cols, data)
    }

    /// Returns the main diagonal of a square tensor.
    pub fn diagonal(&self) -> PureResult<Vec<f32>> {
        if self.rows != self.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: (self.cols, self.rows),
            });
        }
        Ok((0..self.rows)
            .map(|i| self.data[i * self.cols + i])
            .collect())
    }

    /// Sum of the diagonal entries, accumulated in `f64`.
    pub fn trace(&self) -> PureResult<f64> {
        Ok(self.diagonal()?.iter().map(|&v| v as f64).sum())
    }

    /// Matrix product `self · other`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.cols);
        let mut out = vec![0.0; rows * cols];
        let rhs = other.data();
        let kernel = |dst_row: &mut [f32], lhs_row: &[f32]| {
            for (k, &scale) in lhs_row.iter().enumerate() {
                fused_axpy(dst_row, &rhs[k * cols..(k + 1) * cols], scale);
            }
        };
        if parallel_product(rows, inner, cols) {
            out.par_chunks_mut(cols)
                .zip(self.data.par_chunks(inner))
                .for_each(|(dst_row, lhs_row)| kernel(dst_row, lhs_row));
        } else {
            out.chunks_mut(cols)
                .zip(self.data.chunks(inner))
                .for_each(|(dst_row, lhs_row)| kernel(dst_row, lhs_row));
        }
        Tensor::from_parts(rows, cols, out)
    }

    /// Product with a transposed right-hand side, `self · otherᵀ`.
    ///
    /// Entry `(i, j)` is the dot product of row `i` of `self` with row `j` of
    /// `other`, reduced in index order. Hence `a.matmul_transpose(&b)` is the
    /// exact transpose of `b.matmul_transpose(&a)`.
    pub fn matmul_transpose(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.rows);
        let mut out = vec![0.0; rows * cols];
        let rhs = other.data();
        let kernel = |dst_row: &mut [f32], lhs_row: &[f32]| {
            for (j, dst) in dst_row.iter_mut().enumerate() {
                *dst = dot(lhs_row, &rhs[j * inner..(j + 1) * inner]);
            }
        };
        if parallel_product(rows, inner, cols) {
            out.par_chunks_mut(cols)
                .zip(self.data.par_chunks(inner))
                .for_each(|(dst_row, lhs_row)| kernel(dst_row, lhs_row));
        } else {
            out.chunks_mut(cols)
                .zip(self.data.chunks(inner))
                .for_each(|(dst_row, lhs_row)| kernel(dst_row, lhs_row));
        }
        Tensor::from_parts(rows, cols, out)
    }

    /// Product with a transposed left-hand side, `selfᵀ · other`.
    pub fn transpose_matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.rows != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        self.transpose().matmul(other)
    }

    /// Matrix-vector product `self · vector`.
    pub fn matvec(&self, vector: &[f32]) -> PureResult<Vec<f32>> {
        if vector.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: vector.len(),
            });
        }
        Ok(self
            .data
            .chunks(self.cols)
            .map(|row| dot(row, vector))
            .collect())
    }

    /// Element-wise addition.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Element-wise product (Hadamard) between two tensors of identical shape.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    fn zip_with(&self, other: &Tensor, op: impl Fn(f32, f32) -> f32) -> PureResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| op(a, b))
            .collect();
        Tensor::from_parts(self.rows, self.cols, data)
    }

    /// Returns a new tensor where every element is scaled by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|&a| a * value).collect();
        Tensor::from_parts(self.rows, self.cols, data)
    }

    /// Multiplies row `r` by `factors[r]`, i.e. `diag(factors) · self`.
    pub fn scale_rows(&self, factors: &[f32]) -> PureResult<Tensor> {
        if factors.len() != self.rows {
            return Err(TensorError::DataLength {
                expected: self.rows,
                got: factors.len(),
            });
        }
        let mut data = self.to_vec();
        for (row, &factor) in data.chunks_mut(self.cols).zip(factors) {
            row.iter_mut().for_each(|v| *v *= factor);
        }
        Tensor::from_parts(self.rows, self.cols, data)
    }

    /// Add a scaled tensor to this tensor (`self += scale * other`).
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = Arc::make_mut(&mut self.data);
        fused_axpy(data, other.data(), scale);
        Ok(())
    }

    /// Add the provided row vector to every row (`self[row] += bias`).
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        let cols = self.cols;
        let data = Arc::make_mut(&mut self.data);
        for row in data.chunks_mut(cols) {
            for (value, b) in row.iter_mut().zip(bias) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Apply the ReLU activation in-place (`self[i] = max(self[i], 0)`).
    pub fn relu_inplace(&mut self) {
        let data = Arc::make_mut(&mut self.data);
        for value in data.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data: Arc::new(data),
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Returns a reshaped tensor sharing the same buffer.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if rows * cols != self.len() {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: self.len(),
            });
        }
        Ok(Tensor {
            data: Arc::clone(&self.data),
            rows,
            cols,
        })
    }

    /// Returns the sum over rows for each column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row) {
                *sum += value;
            }
        }
        sums
    }

    /// Returns the sum over columns for each row.
    pub fn sum_axis1(&self) -> Vec<f32> {
        self.data
            .chunks(self.cols)
            .map(|row| row.iter().sum())
            .collect()
    }

    /// Concatenates tensors row-wise producing a new tensor whose row count is the sum
    /// of the inputs while preserving the shared column dimension.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        let Some(first) = tensors.first() else {
            return Err(TensorError::EmptyInput("Tensor::cat_rows"));
        };
        let cols = first.cols;
        let mut total_rows = 0usize;
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (tensor.rows, cols),
                });
            }
            total_rows += tensor.rows;
        }
        let mut data = Vec::with_capacity(total_rows * cols);
        for tensor in tensors {
            data.extend_from_slice(tensor.data());
        }
        Tensor::from_parts(total_rows, cols, data)
    }

    /// Computes the squared L2 (Frobenius) norm, accumulated in `f64`.
    pub fn squared_l2_norm(&self) -> f64 {
        self.data.iter().map(|&v| (v as f64) * (v as f64)).sum()
    }

    /// Flat inner product of two tensors of identical shape, accumulated in `f64`.
    pub fn dot(&self, other: &Tensor) -> PureResult<f64> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum())
    }

    /// Largest absolute element-wise difference.
    pub fn max_abs_diff(&self, other: &Tensor) -> PureResult<f32> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max))
    }
}

fn parallel_product(rows: usize, inner: usize, cols: usize) -> bool {
    if current_num_threads() <= 1 || rows < 2 || determinism::lock_reduction_order() {
        return false;
    }
    rows.saturating_mul(inner).saturating_mul(cols) >= PARALLEL_GEMM_THRESHOLD
}

#[inline]
fn fused_axpy(dst: &mut [f32], rhs: &[f32], scale: f32) {
    if scale == 0.0 {
        return;
    }
    debug_assert_eq!(dst.len(), rhs.len());
    for (d, &r) in dst.iter_mut().zip(rhs) {
        *d += scale * r;
    }
}

#[inline]
fn dot(lhs: &[f32], rhs: &[f32]) -> f32 {
    debug_assert_eq!(lhs.len(), rhs.len());
    let mut acc = 0.0f64;
    for (&a, &b) in lhs.iter().zip(rhs) {
        acc += a as f64 * b as f64;
    }
    acc as f32
}
