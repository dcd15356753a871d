// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::TensorError;
use thiserror::Error;

/// Result alias used across the curvature crate.
pub type CurvatureResult<T> = Result<T, CurvatureError>;

/// Failures raised while building or querying a curvature matrix. Every
/// variant aborts the current query; nothing is retried.
#[derive(Debug, Error)]
pub enum CurvatureError {
    /// The model cannot be instrumented as described.
    #[error("invalid curvature setup: {0}")]
    Configuration(String),
    /// No formula exists for the requested statistic.
    #[error("{operation} is not supported by {context}")]
    Unsupported {
        operation: &'static str,
        context: String,
    },
    /// A hook did not capture what an accumulation step needed.
    #[error("instrumentation failed on layer {layer}: {message}")]
    Instrumentation { layer: usize, message: String },
    /// A vector does not fit the space it was used in.
    #[error("vector layout mismatch: expected {expected}, got {got}")]
    LayoutMismatch { expected: String, got: String },
    #[error("eigensolver failed: {0}")]
    Eigen(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl CurvatureError {
    pub(crate) fn unsupported(operation: &'static str, context: impl Into<String>) -> Self {
        CurvatureError::Unsupported {
            operation,
            context: context.into(),
        }
    }

    pub(crate) fn length(expected: usize, got: usize) -> Self {
        CurvatureError::LayoutMismatch {
            expected: format!("{expected} entries"),
            got: format!("{got} entries"),
        }
    }
}
