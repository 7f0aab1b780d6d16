//! Applicability gates for the direct and Winograd strategies
//!
//! A strategy that fails its gate is never benchmarked and never contributes
//! workspace.

use serde::{Deserialize, Serialize};

use crate::conv::params::ConvParams;
use crate::device::DeviceInfo;
use crate::tensor::{DataType, TensorDesc};

const ADDRESS_LIMIT_16: usize = 1 << 16;
const ADDRESS_LIMIT_28: usize = 1 << 28;

/// A device family able to run the precompiled 3x3 Winograd kernels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinogradFamily {
    pub device: String,
    /// Smallest input-channel count the kernels accept
    pub min_input_channels: usize,
}

impl WinogradFamily {
    pub fn new(device: impl Into<String>, min_input_channels: usize) -> Self {
        Self {
            device: device.into(),
            min_input_channels,
        }
    }
}

/// Devices the Winograd strategy is allowed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinogradPolicy {
    pub families: Vec<WinogradFamily>,
}

impl Default for WinogradPolicy {
    fn default() -> Self {
        Self {
            families: vec![
                WinogradFamily::new("gfx803", 16),
                WinogradFamily::new("gfx900", 18),
                WinogradFamily::new("gfx906", 18),
            ],
        }
    }
}

impl WinogradPolicy {
    pub fn family(&self, device: &str) -> Option<&WinogradFamily> {
        self.families.iter().find(|f| f.device == device)
    }
}

fn is_filter(filter: &TensorDesc, h: usize, w: usize) -> bool {
    matches!(filter.dims4(), Ok((_, _, fh, fw)) if fh == h && fw == w)
}

impl ConvParams {
    fn filter_in_allowlist(&self, kh: usize, kw: usize) -> bool {
        let square = kh == kw && matches!(kh, 1 | 3 | 5 | 7 | 9 | 11);
        let strided_rect = kh == 5
            && (kw == 10 || kw == 20)
            && self.stride_h() == 2
            && self.stride_w() == 2
            && self.has_zero_padding();
        square || strided_rect
    }

    /// Whether the direct strategy may run forward or backward-data for `filter`
    pub fn is_direct_supported(&self, filter: &TensorDesc) -> bool {
        let (kh, kw) = match filter.dims4() {
            Ok((_, _, kh, kw)) => (kh, kw),
            Err(_) => return false,
        };
        let large_stride = self.stride_h() > 2 || self.stride_w() > 2;
        let excluded = (kh == 1 && kw == 1 && large_stride)
            || (kh == 1 && kw == 1 && !self.has_zero_padding())
            || (kh == 3 && kw == 3 && large_stride)
            || (kh % 2 == 0 && kw % 2 == 0);
        self.filter_in_allowlist(kh, kw) && !excluded
    }

    /// Whether the direct strategy may compute weight gradients for `filter`
    ///
    /// Unlike [`ConvParams::is_direct_supported`], padded 1x1 filters stay eligible.
    pub fn is_bwd_weights_direct_supported(&self, filter: &TensorDesc) -> bool {
        let (kh, kw) = match filter.dims4() {
            Ok((_, _, kh, kw)) => (kh, kw),
            Err(_) => return false,
        };
        let large_stride = self.stride_h() > 2 || self.stride_w() > 2;
        let excluded = (kh == 1 && kw == 1 && large_stride)
            || (kh == 3 && kw == 3 && large_stride)
            || (kh % 2 == 0 && kw % 2 == 0);
        self.filter_in_allowlist(kh, kw) && !excluded
    }

    /// Whether the precompiled 3x3 Winograd kernels accept the problem
    ///
    /// `data` is the input for forward and the output gradient for backward
    /// data; `forward` picks which filter axis counts as the output channels.
    pub fn is_winograd3x3_supported(
        &self,
        device: &DeviceInfo,
        policy: &WinogradPolicy,
        precompiled_kernels_enabled: bool,
        forward: bool,
        filter: &TensorDesc,
        data: &TensorDesc,
    ) -> bool {
        if !precompiled_kernels_enabled {
            return false;
        }
        let family = match policy.family(&device.name) {
            Some(family) => family,
            None => return false,
        };
        let (batch, n_inputs, height, width) = match data.dims4() {
            Ok(dims) => dims,
            Err(_) => return false,
        };
        let (wei_k, wei_c, kh, kw) = match filter.dims4() {
            Ok(dims) => dims,
            Err(_) => return false,
        };
        let n_outputs = if forward { wei_k } else { wei_c };

        self.pad_h() == 1
            && self.pad_w() == 1
            && kh == 3
            && kw == 3
            && self.has_unit_stride()
            && batch < ADDRESS_LIMIT_16
            && n_inputs < ADDRESS_LIMIT_16
            && n_outputs < ADDRESS_LIMIT_16
            && height < ADDRESS_LIMIT_16
            && width < ADDRESS_LIMIT_16
            && device.compute_units < ADDRESS_LIMIT_16
            && n_inputs * height * width <= ADDRESS_LIMIT_28
            && n_outputs * height * width <= ADDRESS_LIMIT_28
            && n_inputs * kh * kw <= ADDRESS_LIMIT_28
            && n_outputs * kh * kw <= ADDRESS_LIMIT_28
            && n_inputs % 2 == 0
            && n_inputs >= family.min_input_channels
            && filter.data_type() == DataType::Float
            && data.data_type() == DataType::Float
    }

    /// 1x1 filter with unit stride and no padding: GEMM runs without a transform
    pub(crate) fn is_pure_1x1(&self, filter: &TensorDesc) -> bool {
        is_filter(filter, 1, 1)
            && self.has_unit_stride()
            && self.has_zero_padding()
            && self.has_unit_dilation()
    }
}
