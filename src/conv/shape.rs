//! Output, input-gradient and weight-gradient extents of a convolution
//!
//! All arithmetic runs on signed integers so that oversized filters or
//! paddings surface as errors rather than wrapping around.

use crate::conv::params::{ConvMode, ConvParams, PaddingMode};
use crate::error::{Error, Result};
use crate::tensor::TensorDesc;

/// NCHW lengths
pub type Dims4 = (usize, usize, usize, usize);

fn signed(dims: Dims4) -> (i64, i64, i64, i64) {
    (dims.0 as i64, dims.1 as i64, dims.2 as i64, dims.3 as i64)
}

fn ceil_div(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator - 1).div_euclid(denominator)
}

fn positive(value: i64, what: &str) -> Result<usize> {
    if value <= 0 {
        return Err(Error::bad_param(format!(
            "Computed {} of {} is not positive",
            what, value
        )));
    }
    Ok(value as usize)
}

impl ConvParams {
    /// Lengths of the forward output for `input` convolved with `filter`
    pub fn forward_output_dims(&self, input: &TensorDesc, filter: &TensorDesc) -> Result<Dims4> {
        if input.data_type() != filter.data_type() {
            return Err(Error::bad_param("Types do not match for the filter"));
        }
        let (in_n, in_c, in_h, in_w) = signed(input.dims4()?);
        let (wei_k, wei_c, wei_h, wei_w) = signed(filter.dims4()?);

        let (expected_c, out_c) = match self.mode() {
            ConvMode::Convolution => (wei_c, wei_k),
            ConvMode::Transpose => (wei_k, wei_c),
        };
        if in_c != expected_c {
            return Err(Error::bad_param(format!(
                "Channels do not match for the filter: input has {}, filter expects {}",
                in_c, expected_c
            )));
        }

        let (pad_h, pad_w) = (self.pad_h() as i64, self.pad_w() as i64);
        let (u, v) = (self.stride_h() as i64, self.stride_w() as i64);
        let (dil_h, dil_w) = (self.dilation_h() as i64, self.dilation_w() as i64);

        let (out_h, out_w) = match self.padding_mode() {
            PaddingMode::Default => match self.mode() {
                ConvMode::Convolution => (
                    ((in_h - (1 + dil_h * (wei_h - 1)) + 2 * pad_h).div_euclid(u) + 1).max(1),
                    ((in_w - (1 + dil_w * (wei_w - 1)) + 2 * pad_w).div_euclid(v) + 1).max(1),
                ),
                ConvMode::Transpose => (
                    (u * (in_h - 1) + 1 + dil_h * (wei_h - 1) - 2 * pad_h).max(1),
                    (v * (in_w - 1) + 1 + dil_w * (wei_w - 1) - 2 * pad_w).max(1),
                ),
            },
            PaddingMode::Same => (ceil_div(in_h, u), ceil_div(in_w, v)),
            PaddingMode::Valid => {
                if wei_h > in_h || wei_w > in_w {
                    return Err(Error::bad_param(format!(
                        "Filter {}x{} does not fit a {}x{} input without padding",
                        wei_h, wei_w, in_h, in_w
                    )));
                }
                (ceil_div(in_h - wei_h + 1, u), ceil_div(in_w - wei_w + 1, v))
            }
        };

        Ok((
            in_n as usize,
            out_c as usize,
            positive(out_h, "output height")?,
            positive(out_w, "output width")?,
        ))
    }

    /// Lengths of the data gradient recovered from `output` and `filter`
    ///
    /// Inverts the forward extent for the convolution mode; with unit
    /// dilation in convolution mode this is `stride*(out-1) - 2*pad + k`.
    pub fn backward_output_dims(&self, output: &TensorDesc, filter: &TensorDesc) -> Result<Dims4> {
        if output.data_type() != filter.data_type() {
            return Err(Error::bad_param("Types do not match for the filter"));
        }
        let (out_n, out_c, out_h, out_w) = signed(output.dims4()?);
        let (wei_k, wei_c, wei_h, wei_w) = signed(filter.dims4()?);

        let (expected_c, in_c) = match self.mode() {
            ConvMode::Convolution => (wei_k, wei_c),
            ConvMode::Transpose => (wei_c, wei_k),
        };
        if out_c != expected_c {
            return Err(Error::bad_param(format!(
                "Channels do not match for the filter: output has {}, filter expects {}",
                out_c, expected_c
            )));
        }

        let (pad_h, pad_w) = (self.pad_h() as i64, self.pad_w() as i64);
        let (u, v) = (self.stride_h() as i64, self.stride_w() as i64);
        let span_h = 1 + self.dilation_h() as i64 * (wei_h - 1);
        let span_w = 1 + self.dilation_w() as i64 * (wei_w - 1);

        let (in_h, in_w) = match self.mode() {
            ConvMode::Convolution => (
                u * (out_h - 1) - 2 * pad_h + span_h,
                v * (out_w - 1) - 2 * pad_w + span_w,
            ),
            ConvMode::Transpose => (
                (out_h + 2 * pad_h - span_h).div_euclid(u) + 1,
                (out_w + 2 * pad_w - span_w).div_euclid(v) + 1,
            ),
        };

        Ok((
            out_n as usize,
            in_c as usize,
            positive(in_h, "input height")?,
            positive(in_w, "input width")?,
        ))
    }

    /// Lengths of the weight gradient recovered from `input` and `output`
    ///
    /// With unit dilation in convolution mode the filter extent is
    /// `2*pad + in - stride*(out-1)`.
    pub fn backward_weights_dims(&self, input: &TensorDesc, output: &TensorDesc) -> Result<Dims4> {
        if input.data_type() != output.data_type() {
            return Err(Error::bad_param("Types do not match for the filter"));
        }
        let (in_n, in_c, in_h, in_w) = signed(input.dims4()?);
        let (out_n, out_c, out_h, out_w) = signed(output.dims4()?);
        if in_n != out_n {
            return Err(Error::bad_param(format!(
                "Batch sizes do not match: {} and {}",
                in_n, out_n
            )));
        }

        let (pad_h, pad_w) = (self.pad_h() as i64, self.pad_w() as i64);
        let (u, v) = (self.stride_h() as i64, self.stride_w() as i64);
        let (dil_h, dil_w) = (self.dilation_h() as i64, self.dilation_w() as i64);

        // dilated filter span, then back to taps
        let (span_h, span_w, k, c) = match self.mode() {
            ConvMode::Convolution => (
                2 * pad_h + in_h - u * (out_h - 1),
                2 * pad_w + in_w - v * (out_w - 1),
                out_c,
                in_c,
            ),
            ConvMode::Transpose => (
                out_h + 2 * pad_h - u * (in_h - 1),
                out_w + 2 * pad_w - v * (in_w - 1),
                in_c,
                out_c,
            ),
        };
        let wei_h = (span_h - 1).div_euclid(dil_h) + 1;
        let wei_w = (span_w - 1).div_euclid(dil_w) + 1;

        Ok((
            k as usize,
            c as usize,
            positive(wei_h, "filter height")?,
            positive(wei_w, "filter width")?,
        ))
    }

    /// Packed descriptor of the forward output, typed like `input`
    pub fn forward_output_tensor(&self, input: &TensorDesc, filter: &TensorDesc) -> Result<TensorDesc> {
        let (n, c, h, w) = self.forward_output_dims(input, filter)?;
        Ok(TensorDesc::nchw(input.data_type(), n, c, h, w))
    }

    /// Packed descriptor of the data gradient, typed like `output`
    pub fn backward_output_tensor(&self, output: &TensorDesc, filter: &TensorDesc) -> Result<TensorDesc> {
        let (n, c, h, w) = self.backward_output_dims(output, filter)?;
        Ok(TensorDesc::nchw(output.data_type(), n, c, h, w))
    }

    /// Packed descriptor of the weight gradient, typed like `output`
    pub fn backward_weights_tensor(&self, input: &TensorDesc, output: &TensorDesc) -> Result<TensorDesc> {
        let (k, c, h, w) = self.backward_weights_dims(input, output)?;
        Ok(TensorDesc::nchw(output.data_type(), k, c, h, w))
    }
}
