//! Simulated strategy constructors
//!
//! These build deterministic kernel descriptions for [`SimDevice`]
//! (`crate::device::sim::SimDevice`): the names, ABIs and workspace figures
//! follow the shapes real solvers produce, but no kernel source exists.

use crate::conv::gemm::GemmGeometry;
use crate::device::{CompiledInParams, DeviceInfo, KernelAbi, KernelInfo, WinogradExtent};
use crate::error::{Error, Result};
use crate::solver::{
    ConvSolution, Direction, FftSolver, GemmBackend, ProblemDescription, Solver, WinogradSolver,
};

/// Largest batch the backward-weights reduction splits over
const WRW_MAX_SPLIT: usize = 8;

fn filter_hw(problem: &ProblemDescription<'_>) -> Result<(usize, usize)> {
    let (_, _, kh, kw) = problem.weights.dims4()?;
    Ok((kh, kw))
}

fn data_type_define(problem: &ProblemDescription<'_>) -> String {
    format!("-DCONV_{}=1", problem.input.data_type().tag().to_uppercase())
}

/// Direct convolution for forward and backward data
#[derive(Debug, Default)]
pub struct SimDirectSolver {
    /// Report every construction as a build failure
    pub failing: bool,
}

impl SimDirectSolver {
    pub fn failing() -> Self {
        Self { failing: true }
    }
}

impl Solver for SimDirectSolver {
    fn solve(
        &self,
        _device: &DeviceInfo,
        problem: &ProblemDescription<'_>,
        _exhaustive: bool,
    ) -> Result<ConvSolution> {
        if self.failing {
            return Err(Error::Build("direct convolution has no valid configuration".into()));
        }
        let compiled_in = problem.compiled_in_params()?;
        let (kh, kw) = filter_hw(problem)?;
        let params = problem.params;
        let options = format!(
            "-DMLO_FILTER_SIZE0={} -DMLO_FILTER_SIZE1={} {}",
            kw,
            kh,
            data_type_define(problem)
        );

        let kernels = if kh == 1 && kw == 1 && params.has_unit_stride() && params.has_zero_padding() {
            vec![KernelInfo::new(
                "DirectConv1x1Asm",
                "conv1x1.s",
                KernelAbi::Asm(compiled_in),
            )]
        } else if kh == 11 && kw == 11 && problem.direction == Direction::Forward {
            vec![
                KernelInfo::new("DirectConv", "conv11x11.cl", KernelAbi::Ocl).with_options(&options),
                KernelInfo::new("DirectConvPass2", "conv11x11.cl", KernelAbi::Ocl)
                    .with_options(&options),
            ]
        } else {
            vec![KernelInfo::new("DirectConv", "conv_generic.cl", KernelAbi::Ocl).with_options(options)]
        };

        Ok(ConvSolution {
            kernels,
            workspace: 0,
            compiled_in,
        })
    }
}

/// Direct convolution for weight gradients
///
/// Picks a single assembly kernel for small unit-stride filters, a
/// sub-sample pass ahead of it for strided 1x1, and otherwise a partial
/// kernel whose per-split results are summed by a reduction kernel.
#[derive(Debug, Default)]
pub struct SimWrwSolver {
    pub failing: bool,
}

impl Solver for SimWrwSolver {
    fn solve(
        &self,
        _device: &DeviceInfo,
        problem: &ProblemDescription<'_>,
        _exhaustive: bool,
    ) -> Result<ConvSolution> {
        if self.failing {
            return Err(Error::Build("backward weights kernel failed to build".into()));
        }
        let (kh, kw) = filter_hw(problem)?;
        let params = problem.params;
        let mut compiled_in = problem.compiled_in_params()?;
        let elem = problem.input.data_type().size_in_bytes();

        if params.has_unit_stride() && ((kh == 1 && kw == 1) || (kh == 3 && kw == 3)) {
            return Ok(ConvSolution {
                kernels: vec![KernelInfo::new(
                    "WrwConvAsm",
                    "conv_wrw.s",
                    KernelAbi::Asm(compiled_in),
                )],
                workspace: 0,
                compiled_in,
            });
        }

        if kh == 1 && kw == 1 && params.has_zero_padding() {
            // the assembly kernel sees the input after sub-sampling
            let (_, _, out_h, out_w) = problem.output.dims4()?;
            compiled_in.height = out_h;
            compiled_in.width = out_w;
            let workspace = compiled_in.batch * compiled_in.channels * out_h * out_w * elem;
            return Ok(ConvSolution {
                kernels: vec![
                    KernelInfo::new("WrwSubSample", "subsample.cl", KernelAbi::SubSample),
                    KernelInfo::new("WrwConvAsm", "conv_wrw.s", KernelAbi::Asm(compiled_in)),
                ],
                workspace,
                compiled_in,
            });
        }

        let splits = compiled_in.batch.clamp(1, WRW_MAX_SPLIT);
        let workspace = compiled_in.out_channels * compiled_in.channels * kh * kw * elem * splits;
        let options = format!("-DMLO_N_BATCH_LOOPS={} {}", splits, data_type_define(problem));
        Ok(ConvSolution {
            kernels: vec![
                KernelInfo::new("WrwConv", "conv_wrw.cl", KernelAbi::Ocl).with_options(&options),
                KernelInfo::new("WrwReduce", "conv_wrw.cl", KernelAbi::Reduction)
                    .with_options(options),
            ],
            workspace,
            compiled_in,
        })
    }
}

/// Winograd for 3x3 (or, when `rxs` is set, RxS) filters
#[derive(Debug, Default)]
pub struct SimWinogradSolver {
    /// Report a hand-tuned binary for every problem
    pub fast_binary: bool,
    /// Emit the RxS kernel, which takes the filter and output extents
    pub rxs: bool,
}

impl Solver for SimWinogradSolver {
    fn solve(
        &self,
        _device: &DeviceInfo,
        problem: &ProblemDescription<'_>,
        _exhaustive: bool,
    ) -> Result<ConvSolution> {
        let (kh, kw) = filter_hw(problem)?;
        if !self.rxs && (kh != 3 || kw != 3) {
            return Err(Error::NotImplemented(format!(
                "Winograd for a {}x{} filter",
                kh, kw
            )));
        }
        let mut compiled_in = problem.compiled_in_params()?;
        let name = if self.rxs {
            let (_, _, out_h, out_w) = problem.output.dims4()?;
            compiled_in.extent = Some(WinogradExtent {
                out_height: out_h,
                out_width: out_w,
                filter_height: kh,
                filter_width: kw,
                pad_h: problem.params.pad_h(),
                pad_w: problem.params.pad_w(),
            });
            "WinogradConvRxS"
        } else {
            "WinogradConv3x3"
        };

        Ok(ConvSolution {
            kernels: vec![KernelInfo::new(name, "winograd.s", KernelAbi::Asm(compiled_in))],
            workspace: 0,
            compiled_in,
        })
    }
}

impl WinogradSolver for SimWinogradSolver {
    fn is_fast_binary(&self, _device: &DeviceInfo, _problem: &ProblemDescription<'_>) -> bool {
        self.fast_binary
    }
}

/// Frequency-domain convolution over power-of-two tiles
#[derive(Debug, Default)]
pub struct SimFftSolver;

impl SimFftSolver {
    const STAGES: [&'static str; 4] = [
        "FftTransformIn",
        "FftTransformWeights",
        "FftMultiply",
        "FftTransformOut",
    ];

    fn check(problem: &ProblemDescription<'_>) -> Result<()> {
        let (kh, kw) = filter_hw(problem)?;
        let params = problem.params;
        if !params.has_unit_stride() || !params.has_unit_dilation() || (kh == 1 && kw == 1) {
            return Err(Error::NotImplemented(format!(
                "FFT for a {}x{} filter with stride {}x{}",
                kh,
                kw,
                params.stride_h(),
                params.stride_w()
            )));
        }
        Ok(())
    }
}

impl Solver for SimFftSolver {
    fn solve(
        &self,
        _device: &DeviceInfo,
        problem: &ProblemDescription<'_>,
        _exhaustive: bool,
    ) -> Result<ConvSolution> {
        Self::check(problem)?;
        let compiled_in: CompiledInParams = problem.compiled_in_params()?;
        Ok(ConvSolution {
            kernels: Self::STAGES
                .iter()
                .map(|name| KernelInfo::new(*name, "fft.cl", KernelAbi::Utility))
                .collect(),
            workspace: self.workspace_size(problem)?,
            compiled_in,
        })
    }
}

impl FftSolver for SimFftSolver {
    fn workspace_size(&self, problem: &ProblemDescription<'_>) -> Result<usize> {
        if Self::check(problem).is_err() {
            return Ok(0);
        }
        let (n, c, h, w) = problem.input.dims4()?;
        let (k, _, _, _) = problem.weights.dims4()?;
        let (tile_h, tile_w) = (h.next_power_of_two(), w.next_power_of_two());
        // complex bins of the half spectrum, stored as two floats
        let bins = tile_h * (tile_w / 2 + 1) * 2;
        Ok((n * c + k * c + n * k) * bins * std::mem::size_of::<f32>())
    }
}

/// GEMM backend returning one fixed kernel per geometry
#[derive(Debug, Default)]
pub struct SimGemm {
    pub failing: bool,
}

impl GemmBackend for SimGemm {
    fn find_solution(&self, geometry: &GemmGeometry, time_limit: f64) -> Result<KernelInfo> {
        if self.failing {
            return Err(Error::Build(format!(
                "no GEMM kernel for {} within {}s",
                geometry.key(),
                time_limit
            )));
        }
        let options = format!(
            "-DM={} -DN={} -DK={} -DTRANS_A={} -DTRANS_B={}",
            geometry.m, geometry.n, geometry.k, geometry.trans_a as u8, geometry.trans_b as u8
        );
        Ok(KernelInfo::new("SimSgemm", "sgemm.cl", KernelAbi::Gemm).with_options(options))
    }
}
