// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Image layers operating on rows laid out channel-major: one example per
//! row, `C * H * W` columns with column index `c * H * W + y * W + x`.

use crate::hooks::HookPoint;
use crate::module::{LayerSpec, Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

fn validate_positive(value: usize, _label: &str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: 1,
            cols: value,
        });
    }
    Ok(())
}

fn dilated_extent(size: usize, dilation: usize) -> PureResult<usize> {
    size.checked_sub(1)
        .and_then(|value| value.checked_mul(dilation))
        .and_then(|value| value.checked_add(1))
        .ok_or(TensorError::InvalidDimensions {
            rows: size,
            cols: dilation,
        })
}

/// Shape bookkeeping for a 2-D convolution. `output_hw` is derived and kept
/// in sync by the builder methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub input_hw: (usize, usize),
    pub output_hw: (usize, usize),
}

impl ConvGeometry {
    /// Unit stride, no padding, no dilation.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            input_hw,
            output_hw: (0, 0),
        }
        .resolved()
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> PureResult<Self> {
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        self.stride = stride;
        self.resolved()
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> PureResult<Self> {
        self.padding = padding;
        self.resolved()
    }

    pub fn with_dilation(mut self, dilation: (usize, usize)) -> PureResult<Self> {
        validate_positive(dilation.0, "dilation_h")?;
        validate_positive(dilation.1, "dilation_w")?;
        self.dilation = dilation;
        self.resolved()
    }

    fn resolved(mut self) -> PureResult<Self> {
        let (h, w) = self.input_hw;
        let eff_kh = dilated_extent(self.kernel.0, self.dilation.0)?;
        let eff_kw = dilated_extent(self.kernel.1, self.dilation.1)?;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < eff_kh || w + 2 * pw < eff_kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: eff_kh.max(eff_kw),
            });
        }
        self.output_hw = ((h + 2 * ph - eff_kh) / sh + 1, (w + 2 * pw - eff_kw) / sw + 1);
        Ok(self)
    }

    /// Length of one patch, `in_channels * kh * kw`.
    pub fn kernel_span(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }

    /// Number of output positions per channel.
    pub fn spatial(&self) -> usize {
        self.output_hw.0 * self.output_hw.1
    }

    pub fn input_len(&self) -> usize {
        self.in_channels * self.input_hw.0 * self.input_hw.1
    }

    pub fn output_len(&self) -> usize {
        self.out_channels * self.spatial()
    }

    /// Input column read by patch entry `col_idx` at output position
    /// `(oy, ox)`, or `None` when it falls into the padding.
    fn source_index(&self, oy: usize, ox: usize, col_idx: usize) -> Option<usize> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let ic = col_idx / (kh * kw);
        let rem = col_idx % (kh * kw);
        let (ky, kx) = (rem / kw, rem % kw);
        let pos_h = (oy * self.stride.0 + ky * self.dilation.0) as isize - self.padding.0 as isize;
        let pos_w = (ox * self.stride.1 + kx * self.dilation.1) as isize - self.padding.1 as isize;
        if pos_h < 0 || pos_w < 0 || pos_h >= h as isize || pos_w >= w as isize {
            return None;
        }
        Some(ic * h * w + pos_h as usize * w + pos_w as usize)
    }

    fn check_rows(&self, tensor: &Tensor, cols: usize) -> PureResult<usize> {
        let (batch, got) = tensor.shape();
        if got != cols {
            return Err(TensorError::ShapeMismatch {
                left: (batch, got),
                right: (batch, cols),
            });
        }
        Ok(batch)
    }

    /// Unfolds a batch into patches of shape `(batch * spatial, kernel_span)`;
    /// rows of example `b` occupy `b * spatial..(b + 1) * spatial`.
    pub fn im2col(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = self.check_rows(input, self.input_len())?;
        let span = self.kernel_span();
        let (oh, ow) = self.output_hw;
        let spatial = self.spatial();
        let mut columns = vec![0.0f32; batch * spatial * span];
        for b in 0..batch {
            let row = input.row(b)?;
            for oy in 0..oh {
                for ox in 0..ow {
                    let offset = (b * spatial + oy * ow + ox) * span;
                    for col_idx in 0..span {
                        if let Some(index) = self.source_index(oy, ox, col_idx) {
                            columns[offset + col_idx] = row[index];
                        }
                    }
                }
            }
        }
        Tensor::from_vec(batch * spatial, span, columns)
    }

    /// Scatter-adds patch gradients `(batch * spatial, kernel_span)` back onto
    /// input rows.
    pub fn col2im(&self, columns: &Tensor) -> PureResult<Tensor> {
        let span = self.kernel_span();
        let spatial = self.spatial();
        let (rows, cols) = columns.shape();
        if cols != span || rows % spatial != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (spatial, span),
            });
        }
        let batch = rows / spatial;
        let input_len = self.input_len();
        let (oh, ow) = self.output_hw;
        let mut output = vec![0.0f32; batch * input_len];
        let data = columns.data();
        for b in 0..batch {
            let dst = &mut output[b * input_len..(b + 1) * input_len];
            for oy in 0..oh {
                for ox in 0..ow {
                    let offset = (b * spatial + oy * ow + ox) * span;
                    for col_idx in 0..span {
                        if let Some(index) = self.source_index(oy, ox, col_idx) {
                            dst[index] += data[offset + col_idx];
                        }
                    }
                }
            }
        }
        Tensor::from_vec(batch, input_len, output)
    }

    /// Rearranges channel-major output rows `(batch, out_channels * spatial)`
    /// into `(batch * spatial, out_channels)`.
    pub fn output_to_matrix(&self, output: &Tensor) -> PureResult<Tensor> {
        let batch = self.check_rows(output, self.output_len())?;
        let spatial = self.spatial();
        let channels = self.out_channels;
        let mut matrix = vec![0.0f32; batch * spatial * channels];
        for b in 0..batch {
            let row = output.row(b)?;
            for oc in 0..channels {
                for p in 0..spatial {
                    matrix[(b * spatial + p) * channels + oc] = row[oc * spatial + p];
                }
            }
        }
        Tensor::from_vec(batch * spatial, channels, matrix)
    }

    /// Inverse of [`ConvGeometry::output_to_matrix`].
    pub fn matrix_to_output(&self, matrix: &Tensor) -> PureResult<Tensor> {
        let spatial = self.spatial();
        let channels = self.out_channels;
        let (rows, cols) = matrix.shape();
        if cols != channels || rows % spatial != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (spatial, channels),
            });
        }
        let batch = rows / spatial;
        let data = matrix.data();
        let mut output = vec![0.0f32; batch * channels * spatial];
        for b in 0..batch {
            for p in 0..spatial {
                for oc in 0..channels {
                    output[b * channels * spatial + oc * spatial + p] =
                        data[(b * spatial + p) * channels + oc];
                }
            }
        }
        Tensor::from_vec(batch, channels * spatial, output)
    }
}

/// 2-D convolution implemented with im2col. The per-channel bias is
/// optional.
#[derive(Debug)]
pub struct Conv2d {
    name: String,
    weight: Parameter,
    bias: Option<Parameter>,
    geometry: ConvGeometry,
    hooks: HookPoint,
}

impl Conv2d {
    /// Weights and bias drawn uniformly from `±1/sqrt(kernel_span)`.
    pub fn new(name: impl Into<String>, geometry: ConvGeometry) -> PureResult<Self> {
        Self::init(name.into(), geometry, None)
    }

    pub fn seeded(name: impl Into<String>, geometry: ConvGeometry, seed: u64) -> PureResult<Self> {
        Self::init(name.into(), geometry, Some(seed))
    }

    /// Seeded convolution without a bias parameter.
    pub fn without_bias(
        name: impl Into<String>,
        geometry: ConvGeometry,
        seed: u64,
    ) -> PureResult<Self> {
        let mut conv = Self::init(name.into(), geometry, Some(seed))?;
        conv.bias = None;
        Ok(conv)
    }

    fn init(name: String, geometry: ConvGeometry, seed: Option<u64>) -> PureResult<Self> {
        let span = geometry.kernel_span();
        let bound = 1.0 / (span as f32).sqrt();
        let weight = Tensor::random_uniform(geometry.out_channels, span, -bound, bound, seed)?;
        let bias = Tensor::random_uniform(
            1,
            geometry.out_channels,
            -bound,
            bound,
            seed.map(|s| s.wrapping_add(1)),
        )?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Some(Parameter::new(format!("{name}::bias"), bias)),
            name,
            geometry,
            hooks: HookPoint::new(),
        })
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn grad_matrix(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let expected = (input.shape().0, self.geometry.output_len());
        if grad_output.shape() != expected {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: expected,
            });
        }
        self.geometry.output_to_matrix(grad_output)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let patches = self.geometry.im2col(input)?;
        self.hooks.fire_pre_forward(input)?;
        let mut contracted = patches.matmul_transpose(self.weight.value())?;
        if let Some(bias) = &self.bias {
            contracted.add_row_inplace(bias.value().data())?;
        }
        self.geometry.matrix_to_output(&contracted)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let grad_matrix = self.grad_matrix(input, grad_output)?;
        self.hooks.fire_post_backward(grad_output)?;
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        self.geometry.col2im(&grad_patches)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        match &self.bias {
            Some(bias) => visitor(bias),
            None => Ok(()),
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        match &mut self.bias {
            Some(bias) => visitor(bias),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn layer_spec(&self) -> Option<LayerSpec> {
        Some(LayerSpec::Convolution {
            geometry: self.geometry,
            bias: self.bias.is_some(),
        })
    }

    fn hook_point(&self) -> Option<&HookPoint> {
        Some(&self.hooks)
    }
}

/// Max pooling over 2D feature maps.
#[derive(Debug)]
pub struct MaxPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let pool = Self {
            channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        pool.output_hw()?;
        Ok(pool)
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    /// Pooled output together with the flat input index each output reads.
    fn pool(&self, input: &Tensor) -> PureResult<(Tensor, Vec<usize>)> {
        let (batch, cols) = input.shape();
        let expected = self.channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        let (oh, ow) = self.output_hw()?;
        let (h, w) = self.input_hw;
        let out_cols = self.channels * oh * ow;
        let mut out = vec![0.0f32; batch * out_cols];
        let mut indices = vec![0usize; batch * out_cols];
        for b in 0..batch {
            let row = input.row(b)?;
            for c in 0..self.channels {
                let channel_offset = c * h * w;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = None;
                        for ky in 0..self.kernel.0 {
                            for kx in 0..self.kernel.1 {
                                let pos_h = oy * self.stride.0 + ky;
                                let pos_w = ox * self.stride.1 + kx;
                                if pos_h < self.padding.0 || pos_w < self.padding.1 {
                                    continue;
                                }
                                let (iy, ix) = (pos_h - self.padding.0, pos_w - self.padding.1);
                                if iy >= h || ix >= w {
                                    continue;
                                }
                                let index = channel_offset + iy * w + ix;
                                if best_idx.is_none() || row[index] > best {
                                    best = row[index];
                                    best_idx = Some(index);
                                }
                            }
                        }
                        let out_index = b * out_cols + c * oh * ow + oy * ow + ox;
                        let index = best_idx.ok_or(TensorError::InvalidValue {
                            label: "max_pool_window_outside_input",
                        })?;
                        out[out_index] = best;
                        indices[out_index] = index;
                    }
                }
            }
        }
        Ok((Tensor::from_vec(batch, out_cols, out)?, indices))
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(self.pool(input)?.0)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (pooled, indices) = self.pool(input)?;
        if grad_output.shape() != pooled.shape() {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: pooled.shape(),
            });
        }
        let (batch, in_cols) = input.shape();
        let out_cols = pooled.shape().1;
        let mut grad_input = vec![0.0f32; batch * in_cols];
        for (flat, (&index, &grad)) in indices.iter().zip(grad_output.data()).enumerate() {
            let b = flat / out_cols;
            grad_input[b * in_cols + index] += grad;
        }
        Tensor::from_vec(batch, in_cols, grad_input)
    }
}
