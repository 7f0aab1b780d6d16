//! GEMM formulations of a convolution
//!
//! Every GEMM strategy picks exactly one of three sub-paths per call:
//! a plain matrix multiply for 1x1 unit-stride filters, a multiply over a
//! channel-major (CNHW) copy of the whole batch, or a per-sample multiply
//! behind an im2col / col2im transform.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};

use crate::conv::invoke::Launcher;
use crate::conv::params::ConvParams;
use crate::device::{Device, Kernel, KernelAbi, KernelArg};
use crate::error::{Error, Result};
use crate::solver::GemmBackend;
use crate::tensor::TensorDesc;

/// Spatial extent up to which 1x1 unit-stride forward problems use the CNHW path
pub const TRANSPOSE_MAX_SPATIAL: usize = 14;

/// The GEMM sub-path a problem qualifies for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum GemmPath {
    /// 1x1 filter, unit stride, no padding: no transform and no workspace
    Pure1x1,
    /// Whole batch transposed to channel-major, multiplied, transposed back
    TransposeCnhw,
    /// Per-sample im2col (or col2im) into the workspace around the multiply
    Im2Col,
}

fn filter_hw(filter: &TensorDesc) -> Result<(usize, usize)> {
    let (_, _, kh, kw) = filter.dims4()?;
    Ok((kh, kw))
}

impl ConvParams {
    fn is_plain_1x1(&self, kh: usize, kw: usize) -> bool {
        kh == 1 && kw == 1 && self.has_zero_padding() && self.has_unit_dilation()
    }

    /// Forward sub-path for a regular convolution
    pub fn forward_gemm_path(&self, input: &TensorDesc, filter: &TensorDesc) -> Result<GemmPath> {
        let (kh, kw) = filter_hw(filter)?;
        let (_, _, in_h, in_w) = input.dims4()?;
        let small_unit_stride =
            in_h <= TRANSPOSE_MAX_SPATIAL && in_w <= TRANSPOSE_MAX_SPATIAL && self.has_unit_stride();
        let stride_two = self.stride_h() == 2 && self.stride_w() == 2;

        Ok(if self.is_plain_1x1(kh, kw) && (small_unit_stride || stride_two) {
            GemmPath::TransposeCnhw
        } else if self.is_plain_1x1(kh, kw) && self.has_unit_stride() {
            GemmPath::Pure1x1
        } else {
            GemmPath::Im2Col
        })
    }

    /// Backward-data sub-path for a regular convolution
    pub fn backward_data_gemm_path(&self, filter: &TensorDesc) -> Result<GemmPath> {
        let (kh, kw) = filter_hw(filter)?;
        let stride_two = self.stride_h() == 2 && self.stride_w() == 2;

        Ok(if self.is_plain_1x1(kh, kw) && stride_two {
            GemmPath::TransposeCnhw
        } else if self.is_plain_1x1(kh, kw) && self.has_unit_stride() {
            GemmPath::Pure1x1
        } else {
            GemmPath::Im2Col
        })
    }

    /// Sub-path for weight gradients, and for every transpose-mode direction
    ///
    /// Only filter size and stride matter here; padding is ignored.
    pub fn unit_gemm_path(&self, filter: &TensorDesc) -> Result<GemmPath> {
        let (kh, kw) = filter_hw(filter)?;
        Ok(if kh == 1 && kw == 1 && self.has_unit_stride() {
            GemmPath::Pure1x1
        } else {
            GemmPath::Im2Col
        })
    }
}

/// Which convolution formulation a geometry encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr)]
pub enum GemmLayout {
    #[strum(serialize = "conv_fwd")]
    ConvFwd,
    #[strum(serialize = "conv_fwd_cnhw")]
    ConvFwdCnhw,
    #[strum(serialize = "conv_bwd_data")]
    ConvBwdData,
    #[strum(serialize = "conv_bwd_data_cnhw")]
    ConvBwdDataCnhw,
    #[strum(serialize = "conv_bwd_weights")]
    ConvBwdWeights,
    #[strum(serialize = "tran_fwd")]
    TransposeFwd,
    #[strum(serialize = "tran_bwd_data")]
    TransposeBwdData,
    #[strum(serialize = "tran_bwd_weights")]
    TransposeBwdWeights,
}

/// Row-major `C = alpha * op(A) * op(B) + beta * C`
///
/// A geometry is rebuilt identically at search and dispatch time; its
/// [`GemmGeometry::key`] locates the kernel tuned for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemmGeometry {
    pub layout: GemmLayout,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub trans_a: bool,
    pub trans_b: bool,
    pub alpha: f32,
    pub beta: f32,
}

impl GemmGeometry {
    fn build(layout: GemmLayout, m: usize, n: usize, k: usize, trans_a: bool, trans_b: bool) -> Self {
        Self {
            layout,
            m,
            n,
            k,
            lda: if trans_a { m } else { k },
            ldb: if trans_b { k } else { n },
            ldc: n,
            trans_a,
            trans_b,
            alpha: 1.0,
            beta: 0.0,
        }
    }

    fn accumulating(mut self) -> Self {
        self.beta = 1.0;
        self
    }

    /// `y[K, HoWo] = w[K, C*R*S] * col[C*R*S, HoWo]`, one sample at a time
    pub fn conv_fwd(x: &TensorDesc, w: &TensorDesc, y: &TensorDesc) -> Result<Self> {
        x.dims4()?;
        let (wei_k, wei_c, kh, kw) = w.dims4()?;
        let (_, _, out_h, out_w) = y.dims4()?;
        Ok(Self::build(
            GemmLayout::ConvFwd,
            wei_k,
            out_h * out_w,
            wei_c * kh * kw,
            false,
            false,
        ))
    }

    /// `y_t[K, N*HoWo] = w[K, C] * x_t[C, N*HoWo]` over the whole batch
    pub fn conv_fwd_cnhw(x: &TensorDesc, w: &TensorDesc, y: &TensorDesc) -> Result<Self> {
        let (in_n, _, _, _) = x.dims4()?;
        let (wei_k, wei_c, _, _) = w.dims4()?;
        let (_, _, out_h, out_w) = y.dims4()?;
        Ok(Self::build(
            GemmLayout::ConvFwdCnhw,
            wei_k,
            in_n * out_h * out_w,
            wei_c,
            false,
            false,
        ))
    }

    /// `col[C*R*S, HoWo] = w^T * dy[K, HoWo]`, one sample at a time
    pub fn conv_bwd_data(dy: &TensorDesc, w: &TensorDesc, dx: &TensorDesc) -> Result<Self> {
        dx.dims4()?;
        let (wei_k, wei_c, kh, kw) = w.dims4()?;
        let (_, _, out_h, out_w) = dy.dims4()?;
        Ok(Self::build(
            GemmLayout::ConvBwdData,
            wei_c * kh * kw,
            out_h * out_w,
            wei_k,
            true,
            false,
        ))
    }

    /// `dx_t[C, N*HoWo] = w^T * dy_t[K, N*HoWo]` over the whole batch
    pub fn conv_bwd_data_cnhw(dy: &TensorDesc, w: &TensorDesc, dx: &TensorDesc) -> Result<Self> {
        dx.dims4()?;
        let (wei_k, wei_c, _, _) = w.dims4()?;
        let (out_n, _, out_h, out_w) = dy.dims4()?;
        Ok(Self::build(
            GemmLayout::ConvBwdDataCnhw,
            wei_c,
            out_n * out_h * out_w,
            wei_k,
            true,
            false,
        ))
    }

    /// `dw[K, C*R*S] += dy[K, HoWo] * col^T`, accumulated over the batch
    pub fn conv_bwd_weights(dy: &TensorDesc, x: &TensorDesc, dw: &TensorDesc) -> Result<Self> {
        x.dims4()?;
        let (wei_k, wei_c, kh, kw) = dw.dims4()?;
        let (_, _, out_h, out_w) = dy.dims4()?;
        Ok(Self::build(
            GemmLayout::ConvBwdWeights,
            wei_k,
            wei_c * kh * kw,
            out_h * out_w,
            false,
            true,
        )
        .accumulating())
    }

    /// Transpose-mode forward: `col[Co*R*S, HiWi] = w^T * x[Ci, HiWi]`
    pub fn tran_fwd(x: &TensorDesc, w: &TensorDesc, y: &TensorDesc) -> Result<Self> {
        let (_, _, in_h, in_w) = x.dims4()?;
        let (wei_k, wei_c, kh, kw) = w.dims4()?;
        y.dims4()?;
        Ok(Self::build(
            GemmLayout::TransposeFwd,
            wei_c * kh * kw,
            in_h * in_w,
            wei_k,
            true,
            false,
        ))
    }

    /// Transpose-mode data gradient: `dx[Ci, HiWi] = w * col(dy)[Co*R*S, HiWi]`
    pub fn tran_bwd_data(dy: &TensorDesc, w: &TensorDesc, dx: &TensorDesc) -> Result<Self> {
        dy.dims4()?;
        let (wei_k, wei_c, kh, kw) = w.dims4()?;
        let (_, _, in_h, in_w) = dx.dims4()?;
        Ok(Self::build(
            GemmLayout::TransposeBwdData,
            wei_k,
            in_h * in_w,
            wei_c * kh * kw,
            false,
            false,
        ))
    }

    /// Transpose-mode weight gradient: `dw[Ci, Co*R*S] += x * col(dy)^T`
    pub fn tran_bwd_weights(x: &TensorDesc, dy: &TensorDesc, dw: &TensorDesc) -> Result<Self> {
        let (_, _, in_h, in_w) = x.dims4()?;
        dy.dims4()?;
        let (wei_k, wei_c, kh, kw) = dw.dims4()?;
        Ok(Self::build(
            GemmLayout::TransposeBwdWeights,
            wei_k,
            wei_c * kh * kw,
            in_h * in_w,
            false,
            true,
        )
        .accumulating())
    }

    /// Configuration key the tuned kernel is cached under
    pub fn key(&self) -> String {
        format!(
            "{}-m{}n{}k{}-lda{}ldb{}ldc{}-{}{}-b{}",
            self.layout,
            self.m,
            self.n,
            self.k,
            self.lda,
            self.ldb,
            self.ldc,
            if self.trans_a { "T" } else { "N" },
            if self.trans_b { "T" } else { "N" },
            self.beta
        )
    }

    /// Tune a kernel for this geometry and compile it under `algorithm`
    pub fn find_solution(
        &self,
        device: &mut dyn Device,
        backend: &dyn GemmBackend,
        algorithm: &str,
        time_limit: f64,
    ) -> Result<Kernel> {
        let info = backend.find_solution(self, time_limit)?;
        device.add_kernel(algorithm, &self.key(), &info, 0)
    }

    /// The kernel tuned during search; a miss is a usage error
    pub fn kernel(&self, device: &dyn Device, algorithm: &str) -> Result<Kernel> {
        device.kernel(algorithm, &self.key())
    }

    /// Launch `kernel` on three operands, each already at its element offset
    pub(crate) fn run(
        &self,
        l: &mut Launcher<'_>,
        kernel: &Kernel,
        a: KernelArg,
        b: KernelArg,
        c: KernelArg,
    ) -> Result<()> {
        if kernel.abi() != KernelAbi::Gemm {
            return Err(Error::bad_param(format!(
                "Kernel {} is not a GEMM kernel",
                kernel.name()
            )));
        }
        l.launch(
            kernel,
            &[a, b, c, KernelArg::Float(self.alpha), KernelArg::Float(self.beta)],
        )
    }
}
