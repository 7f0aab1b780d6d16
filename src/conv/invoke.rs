//! Launch sequences shared by search and dispatch
//!
//! Search compiles kernels and runs these sequences against scratch buffers
//! to time them; dispatch looks the same kernels up and runs the same
//! sequences against the caller's buffers. Keeping one implementation is
//! what makes a dispatched algorithm reproduce the configuration it was
//! timed with.

use crate::conv::fingerprint::ConfigFingerprint;
use crate::conv::gemm::{GemmGeometry, GemmPath};
use crate::conv::params::ConvParams;
use crate::conv::transforms::{col2im, im2col, set_tensor, BatchTranspose, ColLayout};
use crate::conv::workspace::{
    gemm_transpose_backward_data_workspace, gemm_transpose_forward_workspace,
};
use crate::device::{
    CompiledInParams, Device, DeviceInfo, Kernel, KernelAbi, KernelArg, KernelTimer,
};
use crate::error::{Error, Result};
use crate::solver::{ConvSolution, Direction, ProblemDescription, Solver};
use crate::tensor::{DeviceBuffer, DeviceScalar, TensorArg};

/// Bind `$t` to the host type of `$data_type` and evaluate `$body`
///
/// `$body` must produce a `Result`; 8-bit integer tensors have no kernels.
macro_rules! with_scalar_type {
    ($data_type:expr, $t:ident => $body:expr) => {
        match $data_type {
            $crate::tensor::DataType::Float => {
                type $t = f32;
                $body
            }
            $crate::tensor::DataType::Half => {
                type $t = ::half::f16;
                $body
            }
            $crate::tensor::DataType::BFloat16 => {
                type $t = ::half::bf16;
                $body
            }
            other => Err($crate::error::Error::NotImplemented(format!(
                "{} convolution kernels",
                other
            ))),
        }
    };
}

pub(crate) use with_scalar_type;

/// Winograd flags for the data gradient: reverse R, reverse S, swap K and C
pub(crate) const WINOGRAD_BWD_DATA_FLAGS: i32 = 1 | 2 | 4;

/// Launches kernels and sums their device times
pub(crate) struct Launcher<'d> {
    device: &'d mut dyn Device,
    timer: KernelTimer,
}

impl<'d> Launcher<'d> {
    pub(crate) fn new(device: &'d mut dyn Device) -> Self {
        let timer = KernelTimer::start(&*device);
        Self { device, timer }
    }

    pub(crate) fn device(&mut self) -> &mut dyn Device {
        &mut *self.device
    }

    pub(crate) fn launch(&mut self, kernel: &Kernel, args: &[KernelArg]) -> Result<()> {
        self.device.launch(kernel, args)?;
        self.timer.lap(&*self.device);
        Ok(())
    }

    /// Publish the summed time as the device's kernel time and return it
    pub(crate) fn finish(self) -> f32 {
        let Launcher { device, timer } = self;
        timer.finish(&mut *device);
        device.kernel_time()
    }
}

/// The three tensors of a call plus the caller's workspace
///
/// `input` is x or dx, `output` is y or dy and `weights` is w or dw,
/// whatever the direction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Operands<'a> {
    pub input: TensorArg<'a>,
    pub weights: TensorArg<'a>,
    pub output: TensorArg<'a>,
    pub workspace: Option<&'a DeviceBuffer>,
}

impl<'a> Operands<'a> {
    pub(crate) fn workspace_size(&self) -> usize {
        self.workspace.map_or(0, |ws| ws.size())
    }

    /// The workspace, provided it holds at least `required` bytes
    pub(crate) fn workspace(&self, required: usize) -> Result<&'a DeviceBuffer> {
        match self.workspace {
            Some(ws) if ws.size() >= required => Ok(ws),
            Some(ws) => Err(Error::bad_param(format!(
                "Workspace of {} bytes is smaller than the {} bytes required",
                ws.size(),
                required
            ))),
            None => Err(Error::bad_param(format!(
                "A workspace of {} bytes is required",
                required
            ))),
        }
    }

    fn input_at(&self, sample: usize) -> Result<KernelArg> {
        sample_arg(self.input, sample)
    }

    fn output_at(&self, sample: usize) -> Result<KernelArg> {
        sample_arg(self.output, sample)
    }

    pub(crate) fn batch(&self) -> Result<usize> {
        Ok(self.input.desc.dims4()?.0)
    }
}

fn sample_arg(tensor: TensorArg<'_>, sample: usize) -> Result<KernelArg> {
    let (batch_stride, _, _, _) = tensor.desc.strides4()?;
    Ok(tensor.buffer.arg_at(sample * batch_stride))
}

/// Compile every kernel of `solution` under `(algorithm, key)`, in pass order
///
/// Slots past the solution's last pass are dropped so a shorter solution
/// never inherits passes from an earlier, longer one.
pub(crate) fn compile_solution(
    device: &mut dyn Device,
    algorithm: &str,
    key: &ConfigFingerprint,
    solution: &ConvSolution,
) -> Result<Vec<Kernel>> {
    let kernels = solution
        .kernels
        .iter()
        .enumerate()
        .map(|(index, info)| device.add_kernel(algorithm, key.as_str(), info, index))
        .collect::<Result<Vec<_>>>()?;
    device.truncate_kernels(algorithm, key.as_str(), kernels.len());
    Ok(kernels)
}

/// Workspace a direct weight-gradient run is sized and checked against:
/// the largest any variant of `solver` asks for
pub(crate) fn backward_weights_direct_workspace(
    solver: &dyn Solver,
    device: &DeviceInfo,
    problem: &ProblemDescription<'_>,
) -> Result<usize> {
    Ok(solver
        .solutions(device, problem)?
        .iter()
        .map(|solution| solution.workspace)
        .max()
        .unwrap_or(0))
}

/// Kernels a search compiled under `(algorithm, key)`
pub(crate) fn cached_kernels(
    device: &dyn Device,
    algorithm: &str,
    key: &ConfigFingerprint,
) -> Result<Vec<Kernel>> {
    let kernels = device.kernels(algorithm, key.as_str());
    if kernels.is_empty() {
        return Err(Error::MissingKernel {
            algorithm: algorithm.to_string(),
            network_config: key.to_string(),
        });
    }
    Ok(kernels)
}

/// Arguments of an assembly kernel: compiled-in geometry, flags, three
/// buffers, a null return address, then the RxS extent if present
fn asm_args(compiled_in: &CompiledInParams, flags: i32, buffers: [KernelArg; 3]) -> Vec<KernelArg> {
    let mut args = vec![
        KernelArg::int(compiled_in.batch),
        KernelArg::int(compiled_in.channels),
        KernelArg::int(compiled_in.height),
        KernelArg::int(compiled_in.width),
        KernelArg::int(compiled_in.out_channels),
        KernelArg::int(compiled_in.groups),
        KernelArg::Int(flags),
        KernelArg::Int(0),
    ];
    args.extend_from_slice(&buffers);
    args.push(KernelArg::Null);
    if let Some(extent) = compiled_in.extent {
        args.extend_from_slice(&[
            KernelArg::int(extent.filter_height),
            KernelArg::int(extent.filter_width),
            KernelArg::int(extent.pad_h),
            KernelArg::int(extent.pad_w),
            KernelArg::int(extent.out_height),
            KernelArg::int(extent.out_width),
        ]);
    }
    args
}

/// Direct convolution in one or two passes, each reading `src` and `weights`
/// and writing `dst`
pub(crate) fn run_direct<T: DeviceScalar>(
    l: &mut Launcher<'_>,
    kernels: &[Kernel],
    src: KernelArg,
    weights: KernelArg,
    dst: KernelArg,
) -> Result<()> {
    if kernels.is_empty() || kernels.len() > 2 {
        return Err(Error::bad_param(format!(
            "Direct convolution runs in one or two passes, got {}",
            kernels.len()
        )));
    }
    for kernel in kernels {
        let args = match kernel.abi() {
            KernelAbi::Asm(compiled_in) => asm_args(&compiled_in, 0, [src, weights, dst]),
            KernelAbi::Ocl => vec![src, weights, dst, T::zero().into_arg()],
            other => {
                return Err(Error::bad_param(format!(
                    "Kernel {} has {:?} arguments, not a direct convolution",
                    kernel.name(),
                    other
                )))
            }
        };
        l.launch(kernel, &args)?;
    }
    Ok(())
}

/// Winograd in a single assembly kernel
pub(crate) fn run_winograd(
    l: &mut Launcher<'_>,
    kernel: &Kernel,
    flags: i32,
    src: KernelArg,
    weights: KernelArg,
    dst: KernelArg,
) -> Result<()> {
    match kernel.abi() {
        KernelAbi::Asm(compiled_in) => {
            l.launch(kernel, &asm_args(&compiled_in, flags, [src, weights, dst]))
        }
        other => Err(Error::bad_param(format!(
            "Kernel {} has {:?} arguments, not a Winograd kernel",
            kernel.name(),
            other
        ))),
    }
}

/// Direct weight gradients: one kernel, a sub-sample pass ahead of the main
/// kernel, or the main kernel followed by a reduction over its partial sums
pub(crate) fn run_backward_weights_direct<T: DeviceScalar>(
    l: &mut Launcher<'_>,
    kernels: &[Kernel],
    ops: &Operands<'_>,
    workspace_required: usize,
) -> Result<()> {
    let x = ops.input.buffer.arg();
    let dy = ops.output.buffer.arg();
    let dw = ops.weights.buffer.arg();
    let padding = T::zero().into_arg();

    match kernels {
        [single] => {
            let args = match single.abi() {
                KernelAbi::Asm(compiled_in) => asm_args(&compiled_in, 0, [x, dw, dy]),
                _ => vec![dy, x, dw, padding],
            };
            l.launch(single, &args)
        }
        [first, second] if first.abi() == KernelAbi::SubSample => {
            let ws = ops.workspace(workspace_required)?.arg();
            l.launch(first, &[x, ws])?;
            let args = match second.abi() {
                KernelAbi::Asm(compiled_in) => asm_args(&compiled_in, 0, [ws, dw, dy]),
                _ => vec![dy, ws, dw, padding],
            };
            l.launch(second, &args)
        }
        [main, reduction] => {
            let ws = ops.workspace(workspace_required)?.arg();
            l.launch(main, &[dy, x, ws, padding])?;
            l.launch(reduction, &[ws, dw])
        }
        _ => Err(Error::bad_param(format!(
            "Backward weights runs in one or two passes, got {}",
            kernels.len()
        ))),
    }
}

/// FFT: transform input and weights into the workspace, multiply, transform back
pub(crate) fn run_fft(
    l: &mut Launcher<'_>,
    kernels: &[Kernel],
    src: KernelArg,
    weights: KernelArg,
    dst: KernelArg,
    workspace: &DeviceBuffer,
) -> Result<()> {
    let ws = workspace.arg();
    match kernels {
        [transform_in, transform_weights, multiply, transform_out] => {
            l.launch(transform_in, &[src, ws])?;
            l.launch(transform_weights, &[weights, ws])?;
            l.launch(multiply, &[ws])?;
            l.launch(transform_out, &[ws, dst])
        }
        _ => Err(Error::bad_param(format!(
            "FFT runs in four stages, got {} kernels",
            kernels.len()
        ))),
    }
}

/// A GEMM path with its geometry and tuned kernel
#[derive(Debug, Clone)]
pub(crate) struct GemmPlan {
    pub path: GemmPath,
    pub geometry: GemmGeometry,
    pub kernel: Kernel,
}

impl GemmPlan {
    /// Whether one run covers the whole batch rather than one sample
    pub(crate) fn is_whole_batch(&self) -> bool {
        self.path == GemmPath::TransposeCnhw
    }

    fn gemm(&self, l: &mut Launcher<'_>, a: KernelArg, b: KernelArg, c: KernelArg) -> Result<()> {
        self.geometry.run(l, &self.kernel, a, b, c)
    }
}

/// A GEMM launch sequence over the first `samples` samples; returns the
/// workspace bytes it used
pub(crate) type GemmRunner =
    fn(&mut Launcher<'_>, &ConvParams, &GemmPlan, &Operands<'_>, usize) -> Result<usize>;

/// The GEMM sub-path, geometry and launch sequence for a problem
pub(crate) fn gemm_setup(
    direction: Direction,
    params: &ConvParams,
    ops: &Operands<'_>,
) -> Result<(GemmPath, GemmGeometry, GemmRunner)> {
    let (input, weights, output) = (ops.input.desc, ops.weights.desc, ops.output.desc);
    if params.is_transpose() {
        let path = params.unit_gemm_path(weights)?;
        return Ok(match direction {
            Direction::Forward => (
                path,
                GemmGeometry::tran_fwd(input, weights, output)?,
                gemm_transpose_forward as GemmRunner,
            ),
            Direction::BackwardData => (
                path,
                GemmGeometry::tran_bwd_data(output, weights, input)?,
                gemm_transpose_backward_data as GemmRunner,
            ),
            Direction::BackwardWeights => (
                path,
                GemmGeometry::tran_bwd_weights(input, output, weights)?,
                gemm_transpose_backward_weights as GemmRunner,
            ),
        });
    }

    Ok(match direction {
        Direction::Forward => {
            let path = params.forward_gemm_path(input, weights)?;
            let geometry = if path == GemmPath::TransposeCnhw {
                GemmGeometry::conv_fwd_cnhw(input, weights, output)?
            } else {
                GemmGeometry::conv_fwd(input, weights, output)?
            };
            (path, geometry, gemm_forward as GemmRunner)
        }
        Direction::BackwardData => {
            let path = params.backward_data_gemm_path(weights)?;
            let geometry = if path == GemmPath::TransposeCnhw {
                GemmGeometry::conv_bwd_data_cnhw(output, weights, input)?
            } else {
                GemmGeometry::conv_bwd_data(output, weights, input)?
            };
            (path, geometry, gemm_backward_data::<f32> as GemmRunner)
        }
        Direction::BackwardWeights => (
            params.unit_gemm_path(weights)?,
            GemmGeometry::conv_bwd_weights(output, input, weights)?,
            gemm_backward_weights as GemmRunner,
        ),
    })
}

/// Forward GEMM of a regular convolution over the first `samples` samples
///
/// Returns the workspace bytes the path used.
pub(crate) fn gemm_forward(
    l: &mut Launcher<'_>,
    params: &ConvParams,
    plan: &GemmPlan,
    ops: &Operands<'_>,
    samples: usize,
) -> Result<usize> {
    let (x, w, y) = (ops.input, ops.weights, ops.output);
    match plan.path {
        GemmPath::TransposeCnhw => {
            let (n, c, h, wd) = x.desc.dims4()?;
            let (_, k, out_h, out_w) = y.desc.dims4()?;
            let x_t_elems = n * c * out_h * out_w;
            let required = gemm_transpose_forward_workspace(x.desc, y.desc)?;
            let ws = ops.workspace(required)?;

            BatchTranspose {
                batch: n,
                channels: c,
                in_h: h,
                in_w: wd,
                out_h,
                out_w,
                stride_h: params.stride_h(),
                stride_w: params.stride_w(),
                data_type: x.desc.data_type(),
            }
            .nchw_to_cnhw(l, x.buffer.arg(), ws.arg())?;
            plan.gemm(l, w.buffer.arg(), ws.arg(), ws.arg_at(x_t_elems))?;
            BatchTranspose {
                batch: n,
                channels: k,
                in_h: out_h,
                in_w: out_w,
                out_h,
                out_w,
                stride_h: 1,
                stride_w: 1,
                data_type: y.desc.data_type(),
            }
            .cnhw_to_nchw(l, ws.arg_at(x_t_elems), y.buffer.arg())?;
            Ok(required)
        }
        GemmPath::Pure1x1 => {
            for i in 0..samples {
                plan.gemm(l, w.buffer.arg(), ops.input_at(i)?, ops.output_at(i)?)?;
            }
            Ok(0)
        }
        GemmPath::Im2Col => {
            let layout = ColLayout::new(x.desc, w.desc, y.desc)?;
            let required = layout.col_bytes();
            let ws = ops.workspace(required)?;
            for i in 0..samples {
                im2col(l, params, &layout, ops.input_at(i)?, ws.arg())?;
                plan.gemm(l, w.buffer.arg(), ws.arg(), ops.output_at(i)?)?;
            }
            Ok(required)
        }
    }
}

/// Data-gradient GEMM of a regular convolution over the first `samples` samples
pub(crate) fn gemm_backward_data<T: DeviceScalar>(
    l: &mut Launcher<'_>,
    params: &ConvParams,
    plan: &GemmPlan,
    ops: &Operands<'_>,
    samples: usize,
) -> Result<usize> {
    let (dx, w, dy) = (ops.input, ops.weights, ops.output);
    match plan.path {
        GemmPath::TransposeCnhw => {
            let (n, c, h, wd) = dx.desc.dims4()?;
            let (_, k, out_h, out_w) = dy.desc.dims4()?;
            let dy_elems = dy.desc.element_count();
            let required =
                gemm_transpose_backward_data_workspace(dy.desc, dx.desc)?;
            let ws = ops.workspace(required)?;

            // the strided scatter below leaves gaps that must read as zero
            set_tensor(l, dx.desc, dx.buffer.arg(), T::zero())?;
            BatchTranspose {
                batch: n,
                channels: k,
                in_h: out_h,
                in_w: out_w,
                out_h,
                out_w,
                stride_h: 1,
                stride_w: 1,
                data_type: dy.desc.data_type(),
            }
            .nchw_to_cnhw(l, dy.buffer.arg(), ws.arg())?;
            plan.gemm(l, w.buffer.arg(), ws.arg(), ws.arg_at(dy_elems))?;
            BatchTranspose {
                batch: n,
                channels: c,
                in_h: out_h,
                in_w: out_w,
                out_h: h,
                out_w: wd,
                stride_h: params.stride_h(),
                stride_w: params.stride_w(),
                data_type: dx.desc.data_type(),
            }
            .cnhw_to_nchw(l, ws.arg_at(dy_elems), dx.buffer.arg())?;
            Ok(required)
        }
        GemmPath::Pure1x1 => {
            for i in 0..samples {
                plan.gemm(l, w.buffer.arg(), ops.output_at(i)?, ops.input_at(i)?)?;
            }
            Ok(0)
        }
        GemmPath::Im2Col => {
            let layout = ColLayout::new(dx.desc, w.desc, dy.desc)?;
            let required = layout.col_bytes();
            let ws = ops.workspace(required)?;
            for i in 0..samples {
                plan.gemm(l, w.buffer.arg(), ops.output_at(i)?, ws.arg())?;
                col2im(l, params, &layout, ws.arg(), ops.input_at(i)?)?;
            }
            Ok(required)
        }
    }
}

/// Weight-gradient GEMM of a regular convolution, accumulating into dW
///
/// dW must already be zeroed; the geometry carries beta = 1.
pub(crate) fn gemm_backward_weights(
    l: &mut Launcher<'_>,
    params: &ConvParams,
    plan: &GemmPlan,
    ops: &Operands<'_>,
    samples: usize,
) -> Result<usize> {
    let (x, dw, dy) = (ops.input, ops.weights, ops.output);
    match plan.path {
        GemmPath::Im2Col => {
            let layout = ColLayout::new(x.desc, dw.desc, dy.desc)?;
            let required = layout.col_bytes();
            let ws = ops.workspace(required)?;
            for i in 0..samples {
                im2col(l, params, &layout, ops.input_at(i)?, ws.arg())?;
                plan.gemm(l, ops.output_at(i)?, ws.arg(), dw.buffer.arg())?;
            }
            Ok(required)
        }
        _ => {
            for i in 0..samples {
                plan.gemm(l, ops.output_at(i)?, ops.input_at(i)?, dw.buffer.arg())?;
            }
            Ok(0)
        }
    }
}

/// Forward GEMM of a transpose-mode convolution: multiply, then fold the
/// columns onto the larger output
pub(crate) fn gemm_transpose_forward(
    l: &mut Launcher<'_>,
    params: &ConvParams,
    plan: &GemmPlan,
    ops: &Operands<'_>,
    samples: usize,
) -> Result<usize> {
    let (x, w, y) = (ops.input, ops.weights, ops.output);
    match plan.path {
        GemmPath::Im2Col => {
            let layout = ColLayout::new(y.desc, w.desc, x.desc)?;
            let required = layout.col_bytes();
            let ws = ops.workspace(required)?;
            for i in 0..samples {
                plan.gemm(l, w.buffer.arg(), ops.input_at(i)?, ws.arg())?;
                col2im(l, params, &layout, ws.arg(), ops.output_at(i)?)?;
            }
            Ok(required)
        }
        _ => {
            for i in 0..samples {
                plan.gemm(l, w.buffer.arg(), ops.input_at(i)?, ops.output_at(i)?)?;
            }
            Ok(0)
        }
    }
}

/// Data-gradient GEMM of a transpose-mode convolution: unroll dY, then multiply
pub(crate) fn gemm_transpose_backward_data(
    l: &mut Launcher<'_>,
    params: &ConvParams,
    plan: &GemmPlan,
    ops: &Operands<'_>,
    samples: usize,
) -> Result<usize> {
    let (dx, w, dy) = (ops.input, ops.weights, ops.output);
    match plan.path {
        GemmPath::Im2Col => {
            let layout = ColLayout::new(dy.desc, w.desc, dx.desc)?;
            let required = layout.col_bytes();
            let ws = ops.workspace(required)?;
            for i in 0..samples {
                im2col(l, params, &layout, ops.output_at(i)?, ws.arg())?;
                plan.gemm(l, w.buffer.arg(), ws.arg(), ops.input_at(i)?)?;
            }
            Ok(required)
        }
        _ => {
            for i in 0..samples {
                plan.gemm(l, w.buffer.arg(), ops.output_at(i)?, ops.input_at(i)?)?;
            }
            Ok(0)
        }
    }
}

/// Weight-gradient GEMM of a transpose-mode convolution, accumulating into dW
pub(crate) fn gemm_transpose_backward_weights(
    l: &mut Launcher<'_>,
    params: &ConvParams,
    plan: &GemmPlan,
    ops: &Operands<'_>,
    samples: usize,
) -> Result<usize> {
    let (x, dw, dy) = (ops.input, ops.weights, ops.output);
    match plan.path {
        GemmPath::Im2Col => {
            let layout = ColLayout::new(dy.desc, dw.desc, x.desc)?;
            let required = layout.col_bytes();
            let ws = ops.workspace(required)?;
            for i in 0..samples {
                im2col(l, params, &layout, ops.output_at(i)?, ws.arg())?;
                plan.gemm(l, ops.input_at(i)?, ws.arg(), dw.buffer.arg())?;
            }
            Ok(required)
        }
        _ => {
            for i in 0..samples {
                plan.gemm(l, ops.input_at(i)?, ops.output_at(i)?, dw.buffer.arg())?;
            }
            Ok(0)
        }
    }
}
