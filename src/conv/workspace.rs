//! Scratch-memory sizing
//!
//! Each strategy family reports the bytes it needs for a problem. The
//! per-direction queries on [`ConvolutionContext`] take the maximum over the
//! families that can still be chosen for that problem, so one buffer of that
//! size serves any search outcome. Results are cached by fingerprint.

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::conv::fingerprint::ConfigFingerprint;
use crate::conv::gemm::GemmPath;
use crate::conv::params::ConvParams;
use crate::device::{Device, DeviceInfo};
use crate::error::Result;
use crate::execution::context::ConvolutionContext;
use crate::solver::{Direction, ProblemDescription, Solver};
use crate::tensor::{DataType, TensorDesc};

/// When GEMM workspace is reported as zero instead of its real size
///
/// Devices named in `constrained_devices` cannot back a scratch buffer above
/// `workspace_limit_bytes`; the GEMM path then runs without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPolicy {
    pub workspace_limit_bytes: usize,
    pub constrained_devices: Vec<String>,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            workspace_limit_bytes: 1 << 30,
            constrained_devices: vec!["gfx803".to_string()],
        }
    }
}

impl CapacityPolicy {
    pub fn is_constrained(&self, device: &DeviceInfo) -> bool {
        self.constrained_devices.iter().any(|d| *d == device.name)
    }

    /// `bytes`, or 0 if it exceeds the limit on a constrained device
    pub fn apply(&self, device: &DeviceInfo, bytes: usize) -> usize {
        if bytes > self.workspace_limit_bytes && self.is_constrained(device) {
            debug!(
                "Dropping {} bytes of GEMM workspace on {}",
                bytes, device.name
            );
            0
        } else {
            bytes
        }
    }
}

fn unit_filter_no_transform(params: &ConvParams, filter: &TensorDesc) -> Result<bool> {
    let (_, _, kh, kw) = filter.dims4()?;
    Ok(kh == 1 && kw == 1 && params.has_unit_stride() && params.has_zero_padding())
}

/// im2col buffer for forward: `C * R * S * Ho * Wo` elements of `output`
pub fn gemm_forward_workspace(
    params: &ConvParams,
    capacity: &CapacityPolicy,
    device: &DeviceInfo,
    filter: &TensorDesc,
    output: &TensorDesc,
) -> Result<usize> {
    let (_, _, out_h, out_w) = output.dims4()?;
    let (_, wei_c, kh, kw) = filter.dims4()?;
    if unit_filter_no_transform(params, filter)? {
        return Ok(0);
    }
    let bytes = wei_c * kh * kw * out_h * out_w * output.data_type().size_in_bytes();
    Ok(capacity.apply(device, bytes))
}

/// col2im buffer for backward data, laid out like the forward one over `dy`
pub fn gemm_backward_data_workspace(
    params: &ConvParams,
    capacity: &CapacityPolicy,
    device: &DeviceInfo,
    filter: &TensorDesc,
    dy: &TensorDesc,
) -> Result<usize> {
    gemm_forward_workspace(params, capacity, device, filter, dy)
}

/// im2col buffer for weight gradients: `C * R * S * Ho * Wo` of `dw` and `dy`
pub fn gemm_backward_weights_workspace(
    params: &ConvParams,
    capacity: &CapacityPolicy,
    device: &DeviceInfo,
    dy: &TensorDesc,
    dw: &TensorDesc,
) -> Result<usize> {
    gemm_forward_workspace(params, capacity, device, dw, dy)
}

/// Whole-batch channel-major copies of the input (at output resolution) and the output
pub fn gemm_transpose_forward_workspace(x: &TensorDesc, y: &TensorDesc) -> Result<usize> {
    let (in_n, in_c, _, _) = x.dims4()?;
    let (_, _, out_h, out_w) = y.dims4()?;
    let x_t = in_n * in_c * out_h * out_w * x.data_type().size_in_bytes();
    Ok(x_t + y.byte_size())
}

/// Whole-batch channel-major copies of the data gradient (at `dy` resolution) and of `dy`
pub fn gemm_transpose_backward_data_workspace(dy: &TensorDesc, dx: &TensorDesc) -> Result<usize> {
    let (in_n, in_c, _, _) = dx.dims4()?;
    let (_, _, out_h, out_w) = dy.dims4()?;
    let dx_t = in_n * in_c * out_h * out_w * dx.data_type().size_in_bytes();
    Ok(dx_t + dy.byte_size())
}

/// Largest workspace any variant of `solver` asks for; 0 when none can be built
fn direct_workspace(
    solver: Option<&dyn Solver>,
    device: &DeviceInfo,
    problem: &ProblemDescription<'_>,
) -> usize {
    let solver = match solver {
        Some(solver) => solver,
        None => return 0,
    };
    match solver.solutions(device, problem) {
        Ok(solutions) => solutions.iter().map(|s| s.workspace).max().unwrap_or(0),
        Err(e) => {
            trace!("No direct workspace for {:?}: {}", problem.direction, e);
            0
        }
    }
}

impl ConvParams {
    /// Direct weight gradients also need unit dilation and a filter no taller than wide
    pub fn is_bwd_weights_direct_applicable(&self, filter: &TensorDesc) -> bool {
        let wide_enough = matches!(filter.dims4(), Ok((_, _, kh, kw)) if kw >= kh);
        self.has_unit_dilation() && wide_enough && self.is_bwd_weights_direct_supported(filter)
    }
}

impl<D: Device> ConvolutionContext<D> {
    fn direct_enabled_for(&self, params: &ConvParams, filter: &TensorDesc) -> bool {
        self.options.direct_enabled && params.is_direct_supported(filter)
    }

    pub(crate) fn winograd_supported(
        &self,
        params: &ConvParams,
        forward: bool,
        filter: &TensorDesc,
        data: &TensorDesc,
    ) -> bool {
        self.backends.winograd.is_some()
            && params.is_winograd3x3_supported(
                &self.device.info(),
                &self.options.winograd,
                self.options.precompiled_kernels_enabled,
                forward,
                filter,
                data,
            )
    }

    fn fft_workspace(&self, problem: &ProblemDescription<'_>) -> Result<usize> {
        match &self.backends.fft {
            Some(fft) => fft.workspace_size(problem),
            None => Ok(0),
        }
    }

    fn gemm_or_zero(
        &self,
        data_type: DataType,
        size: impl FnOnce() -> Result<usize>,
    ) -> Result<usize> {
        if self.gemm_available(data_type) {
            size()
        } else {
            Ok(0)
        }
    }

    /// Scratch bytes that cover every forward candidate for the problem
    pub fn forward_workspace_size(
        &mut self,
        params: &ConvParams,
        w: &TensorDesc,
        x: &TensorDesc,
        y: &TensorDesc,
    ) -> Result<usize> {
        let key = ConfigFingerprint::new(Direction::Forward, x, w, y, params)?;
        if let Some(size) = self.cache.forward.workspace(&key) {
            trace!("Forward workspace cache hit for {}", key);
            return Ok(size);
        }

        let info = self.device.info();
        let capacity = &self.options.capacity;
        let data_type = x.data_type();
        let size = if params.is_transpose() {
            self.gemm_or_zero(data_type, || {
                gemm_backward_data_workspace(params, capacity, &info, w, x)
            })?
        } else {
            let problem = ProblemDescription::new(Direction::Forward, x, w, y, params);
            let direct = if self.direct_enabled_for(params, w) {
                direct_workspace(self.backends.direct.as_deref(), &info, &problem)
            } else {
                0
            };

            if !params.has_unit_dilation() {
                let gemm = self.gemm_or_zero(data_type, || {
                    gemm_forward_workspace(params, capacity, &info, w, y)
                })?;
                gemm.max(direct)
            } else if params.forward_gemm_path(x, w)? == GemmPath::TransposeCnhw {
                let gemm = self.gemm_or_zero(data_type, || gemm_transpose_forward_workspace(x, y))?;
                gemm.max(direct)
            } else if self.winograd_supported(params, true, w, x) {
                0
            } else {
                let gemm = self.gemm_or_zero(data_type, || {
                    gemm_forward_workspace(params, capacity, &info, w, y)
                })?;
                self.fft_workspace(&problem)?.max(gemm).max(direct)
            }
        };

        debug!("Forward workspace for {}: {} bytes", key, size);
        Ok(self.cache.forward.insert_workspace(key, size))
    }

    /// Scratch bytes that cover every backward-data candidate for the problem
    pub fn backward_data_workspace_size(
        &mut self,
        params: &ConvParams,
        w: &TensorDesc,
        dy: &TensorDesc,
        dx: &TensorDesc,
    ) -> Result<usize> {
        let key = ConfigFingerprint::new(Direction::BackwardData, dx, w, dy, params)?;
        if let Some(size) = self.cache.backward_data.workspace(&key) {
            trace!("Backward data workspace cache hit for {}", key);
            return Ok(size);
        }

        let info = self.device.info();
        let capacity = &self.options.capacity;
        let data_type = dy.data_type();
        let size = if params.is_transpose() {
            self.gemm_or_zero(data_type, || {
                gemm_forward_workspace(params, capacity, &info, w, dx)
            })?
        } else {
            let problem = ProblemDescription::new(Direction::BackwardData, dx, w, dy, params);
            let direct = if self.direct_enabled_for(params, w) {
                direct_workspace(self.backends.direct.as_deref(), &info, &problem)
            } else {
                0
            };

            if !params.has_unit_dilation() {
                let gemm = self.gemm_or_zero(data_type, || {
                    gemm_backward_data_workspace(params, capacity, &info, w, dy)
                })?;
                gemm.max(direct)
            } else if params.backward_data_gemm_path(w)? == GemmPath::TransposeCnhw {
                let gemm = self.gemm_or_zero(data_type, || {
                    gemm_transpose_backward_data_workspace(dy, dx)
                })?;
                gemm.max(direct)
            } else if self.winograd_supported(params, false, w, dy) {
                0
            } else {
                let gemm = self.gemm_or_zero(data_type, || {
                    gemm_backward_data_workspace(params, capacity, &info, w, dy)
                })?;
                self.fft_workspace(&problem)?.max(gemm).max(direct)
            }
        };

        debug!("Backward data workspace for {}: {} bytes", key, size);
        Ok(self.cache.backward_data.insert_workspace(key, size))
    }

    /// Scratch bytes that cover every backward-weights candidate for the problem
    pub fn backward_weights_workspace_size(
        &mut self,
        params: &ConvParams,
        dy: &TensorDesc,
        x: &TensorDesc,
        dw: &TensorDesc,
    ) -> Result<usize> {
        let key = ConfigFingerprint::new(Direction::BackwardWeights, x, dw, dy, params)?;
        if let Some(size) = self.cache.backward_weights.workspace(&key) {
            trace!("Backward weights workspace cache hit for {}", key);
            return Ok(size);
        }

        let info = self.device.info();
        let capacity = &self.options.capacity;
        let data_type = dy.data_type();
        let size = if params.is_transpose() {
            // input and output swap roles for the fractionally-strided problem
            self.gemm_or_zero(data_type, || {
                gemm_backward_weights_workspace(params, capacity, &info, x, dw)
            })?
        } else {
            let problem = ProblemDescription::new(Direction::BackwardWeights, x, dw, dy, params);
            let direct = if self.options.direct_enabled && params.is_bwd_weights_direct_applicable(dw)
            {
                direct_workspace(self.backends.backward_weights.as_deref(), &info, &problem)
            } else {
                0
            };
            let gemm = self.gemm_or_zero(data_type, || {
                gemm_backward_weights_workspace(params, capacity, &info, dy, dw)
            })?;
            gemm.max(direct)
        };

        debug!("Backward weights workspace for {}: {} bytes", key, size);
        Ok(self.cache.backward_weights.insert_workspace(key, size))
    }
}
