use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Whether the problem is a regular or a fractionally-strided convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum ConvMode {
    #[strum(serialize = "conv")]
    Convolution,
    #[strum(serialize = "trans")]
    Transpose,
}

impl TryFrom<i32> for ConvMode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ConvMode::Convolution),
            1 => Ok(ConvMode::Transpose),
            other => Err(Error::bad_param(format!(
                "Convolution mode {} not supported",
                other
            ))),
        }
    }
}

/// How the output extent is derived from the input extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum PaddingMode {
    /// Explicit padding
    #[strum(serialize = "default")]
    Default,
    /// `out = ceil(in / stride)`
    #[strum(serialize = "same")]
    Same,
    /// No padding, `out = ceil((in - k + 1) / stride)`
    #[strum(serialize = "valid")]
    Valid,
}

impl TryFrom<i32> for PaddingMode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(PaddingMode::Default),
            1 => Ok(PaddingMode::Same),
            2 => Ok(PaddingMode::Valid),
            other => Err(Error::bad_param(format!("Padding mode {} not supported", other))),
        }
    }
}

/// Padding, stride and dilation of a 2D convolution
///
/// Validated on construction and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvParams {
    mode: ConvMode,
    padding_mode: PaddingMode,
    pad_h: usize,
    pad_w: usize,
    stride_h: usize,
    stride_w: usize,
    dilation_h: usize,
    dilation_w: usize,
}

impl ConvParams {
    /// Regular convolution with explicit padding
    pub fn new(
        pad_h: i32,
        pad_w: i32,
        stride_h: i32,
        stride_w: i32,
        dilation_h: i32,
        dilation_w: i32,
    ) -> Result<Self> {
        Self::with_modes(
            ConvMode::Convolution,
            PaddingMode::Default,
            pad_h,
            pad_w,
            stride_h,
            stride_w,
            dilation_h,
            dilation_w,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_modes(
        mode: ConvMode,
        padding_mode: PaddingMode,
        pad_h: i32,
        pad_w: i32,
        stride_h: i32,
        stride_w: i32,
        dilation_h: i32,
        dilation_w: i32,
    ) -> Result<Self> {
        if pad_h < 0
            || pad_w < 0
            || stride_h <= 0
            || stride_w <= 0
            || dilation_h <= 0
            || dilation_w <= 0
            || dilation_h != dilation_w
        {
            return Err(Error::bad_param(format!(
                "Invalid parameters (pad {}x{}, stride {}x{}, dilation {}x{}): expected \
                 padding >= 0, stride >= 1, dilation >= 1 and the same dilation in both axes",
                pad_h, pad_w, stride_h, stride_w, dilation_h, dilation_w
            )));
        }

        Ok(Self {
            mode,
            padding_mode,
            pad_h: pad_h as usize,
            pad_w: pad_w as usize,
            stride_h: stride_h as usize,
            stride_w: stride_w as usize,
            dilation_h: dilation_h as usize,
            dilation_w: dilation_w as usize,
        })
    }

    pub fn mode(&self) -> ConvMode {
        self.mode
    }

    pub fn padding_mode(&self) -> PaddingMode {
        self.padding_mode
    }

    pub fn pad_h(&self) -> usize {
        self.pad_h
    }

    pub fn pad_w(&self) -> usize {
        self.pad_w
    }

    pub fn stride_h(&self) -> usize {
        self.stride_h
    }

    pub fn stride_w(&self) -> usize {
        self.stride_w
    }

    pub fn dilation_h(&self) -> usize {
        self.dilation_h
    }

    pub fn dilation_w(&self) -> usize {
        self.dilation_w
    }

    pub fn is_transpose(&self) -> bool {
        self.mode == ConvMode::Transpose
    }

    pub(crate) fn has_unit_stride(&self) -> bool {
        self.stride_h == 1 && self.stride_w == 1
    }

    pub(crate) fn has_zero_padding(&self) -> bool {
        self.pad_h == 0 && self.pad_w == 0
    }

    pub(crate) fn has_unit_dilation(&self) -> bool {
        self.dilation_h == 1 && self.dilation_w == 1
    }
}

impl fmt::Display for ConvParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}, {}",
            self.pad_h, self.pad_w, self.stride_h, self.stride_w, self.dilation_h, self.dilation_w
        )
    }
}
