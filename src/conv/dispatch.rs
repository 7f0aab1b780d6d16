//! Running a previously found algorithm on caller buffers
//!
//! Dispatch rebuilds the configuration key and GEMM geometry the search used,
//! fetches the kernels compiled under them and runs the same launch sequence
//! over the whole batch. It never compiles a solver kernel itself: a missing
//! kernel means the algorithm was never found for this problem.

use log::{debug, trace};

use crate::conv::algorithm::{
    ConvAlgorithm, ConvBwdDataAlgorithm, ConvBwdWeightsAlgorithm, ConvFwdAlgorithm,
};
use crate::conv::fingerprint::ConfigFingerprint;
use crate::conv::invoke::{
    backward_weights_direct_workspace, cached_kernels, gemm_setup, run_backward_weights_direct,
    run_direct, run_fft, run_winograd, with_scalar_type, GemmPlan, Launcher, Operands,
    WINOGRAD_BWD_DATA_FLAGS,
};
use crate::conv::params::ConvParams;
use crate::conv::search::validate_problem;
use crate::conv::transforms::set_tensor;
use crate::device::{Device, Kernel};
use crate::error::{Error, Result};
use crate::execution::context::ConvolutionContext;
use crate::solver::{Direction, ProblemDescription};
use crate::tensor::{DeviceBuffer, TensorArg};

/// Only `alpha = 1, beta = 0` is implemented
pub(crate) fn check_scaling(alpha: f32, beta: f32) -> Result<()> {
    if (alpha - 1.0).abs() > f32::EPSILON || beta.abs() > f32::EPSILON {
        return Err(Error::NotImplemented(format!(
            "Only alpha=1 and beta=0 is supported, got alpha={} beta={}",
            alpha, beta
        )));
    }
    Ok(())
}

fn first_kernel(kernels: &[Kernel], algorithm: &str) -> Result<Kernel> {
    kernels
        .first()
        .cloned()
        .ok_or_else(|| Error::bad_param(format!("No kernels cached for {}", algorithm)))
}

fn only_gemm_in_transpose_mode(params: &ConvParams, gemm: bool, algorithm: &str) -> Result<()> {
    if params.is_transpose() && !gemm {
        return Err(Error::bad_param(format!(
            "{} cannot run a transpose-mode convolution",
            algorithm
        )));
    }
    Ok(())
}

impl<D: Device> ConvolutionContext<D> {
    fn check_inputs(&self, tensors: &[TensorArg<'_>]) -> Result<()> {
        if !self.options.check_numerics {
            return Ok(());
        }
        tensors
            .iter()
            .try_for_each(|tensor| self.numerics.check(&self.device, *tensor))
    }

    fn check_output(&self, tensor: TensorArg<'_>) -> Result<()> {
        if !self.options.check_numerics {
            return Ok(());
        }
        self.numerics.check(&self.device, tensor)
    }

    /// Run the GEMM tuned for this problem over the whole batch
    fn dispatch_gemm(
        &mut self,
        direction: Direction,
        algorithm: &str,
        params: &ConvParams,
        ops: &Operands<'_>,
    ) -> Result<f32> {
        if !self.gemm_available(ops.input.desc.data_type()) {
            return Err(Error::NotImplemented("GEMM is not supported".to_string()));
        }
        let (path, geometry, run) = gemm_setup(direction, params, ops)?;
        let kernel = geometry.kernel(&self.device, algorithm)?;
        let plan = GemmPlan {
            path,
            geometry,
            kernel,
        };
        let batch = ops.batch()?;
        trace!("{} over {} sample(s) on the {} path", algorithm, batch, plan.path);

        let mut launcher = Launcher::new(&mut self.device);
        run(&mut launcher, params, &plan, ops, batch)?;
        Ok(launcher.finish())
    }

    /// Direct-family kernels, one or two passes
    fn dispatch_direct(
        &mut self,
        algorithm: &str,
        key: &ConfigFingerprint,
        src: TensorArg<'_>,
        weights: TensorArg<'_>,
        dst: TensorArg<'_>,
    ) -> Result<f32> {
        let kernels = cached_kernels(&self.device, algorithm, key)?;
        let mut launcher = Launcher::new(&mut self.device);
        with_scalar_type!(src.desc.data_type(), T => {
            run_direct::<T>(
                &mut launcher,
                &kernels,
                src.buffer.arg(),
                weights.buffer.arg(),
                dst.buffer.arg(),
            )
        })?;
        Ok(launcher.finish())
    }

    fn dispatch_winograd(
        &mut self,
        algorithm: &str,
        key: &ConfigFingerprint,
        flags: i32,
        src: TensorArg<'_>,
        weights: TensorArg<'_>,
        dst: TensorArg<'_>,
    ) -> Result<f32> {
        let kernels = cached_kernels(&self.device, algorithm, key)?;
        let kernel = first_kernel(&kernels, algorithm)?;
        let mut launcher = Launcher::new(&mut self.device);
        run_winograd(
            &mut launcher,
            &kernel,
            flags,
            src.buffer.arg(),
            weights.buffer.arg(),
            dst.buffer.arg(),
        )?;
        Ok(launcher.finish())
    }

    fn dispatch_fft(
        &mut self,
        algorithm: &str,
        key: &ConfigFingerprint,
        problem: &ProblemDescription<'_>,
        ops: &Operands<'_>,
        src: TensorArg<'_>,
        dst: TensorArg<'_>,
    ) -> Result<f32> {
        let required = match &self.backends.fft {
            Some(fft) => fft.workspace_size(problem)?,
            None => return Err(Error::NotImplemented("FFT is not supported".to_string())),
        };
        let workspace = ops.workspace(required)?;
        let kernels = cached_kernels(&self.device, algorithm, key)?;
        let mut launcher = Launcher::new(&mut self.device);
        run_fft(
            &mut launcher,
            &kernels,
            src.buffer.arg(),
            ops.weights.buffer.arg(),
            dst.buffer.arg(),
            workspace,
        )?;
        Ok(launcher.finish())
    }

    /// Compute `y = x * w` with an algorithm found by [`ConvolutionContext::find_forward`]
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &mut self,
        params: &ConvParams,
        alpha: f32,
        x: TensorArg<'_>,
        w: TensorArg<'_>,
        algorithm: ConvFwdAlgorithm,
        beta: f32,
        y: TensorArg<'_>,
        workspace: Option<&DeviceBuffer>,
    ) -> Result<()> {
        validate_problem(params, x, w, y)?;
        check_scaling(alpha, beta)?;
        self.check_inputs(&[x, w])?;

        let name = algorithm.name();
        only_gemm_in_transpose_mode(params, algorithm == ConvFwdAlgorithm::Gemm, name)?;
        let key = ConfigFingerprint::new(Direction::Forward, x.desc, w.desc, y.desc, params)?;
        let ops = Operands {
            input: x,
            weights: w,
            output: y,
            workspace,
        };

        let time = match algorithm {
            ConvFwdAlgorithm::Gemm => self.dispatch_gemm(Direction::Forward, name, params, &ops)?,
            ConvFwdAlgorithm::Direct => self.dispatch_direct(name, &key, x, w, y)?,
            ConvFwdAlgorithm::Winograd => self.dispatch_winograd(name, &key, 0, x, w, y)?,
            ConvFwdAlgorithm::Fft => {
                let problem =
                    ProblemDescription::new(Direction::Forward, x.desc, w.desc, y.desc, params);
                self.dispatch_fft(name, &key, &problem, &ops, x, y)?
            }
        };
        debug!("{} ran {} in {} ms", name, key, time);

        self.check_output(y)
    }

    /// Compute `dx` from `dy` and `w` with an algorithm found by
    /// [`ConvolutionContext::find_backward_data`]
    #[allow(clippy::too_many_arguments)]
    pub fn backward_data(
        &mut self,
        params: &ConvParams,
        alpha: f32,
        dy: TensorArg<'_>,
        w: TensorArg<'_>,
        algorithm: ConvBwdDataAlgorithm,
        beta: f32,
        dx: TensorArg<'_>,
        workspace: Option<&DeviceBuffer>,
    ) -> Result<()> {
        validate_problem(params, dx, w, dy)?;
        check_scaling(alpha, beta)?;
        self.check_inputs(&[dy, w])?;

        let name = algorithm.name();
        let gemm = matches!(
            algorithm,
            ConvBwdDataAlgorithm::Gemm | ConvBwdDataAlgorithm::TransposeGemm
        );
        only_gemm_in_transpose_mode(params, gemm, name)?;
        let key =
            ConfigFingerprint::new(Direction::BackwardData, dx.desc, w.desc, dy.desc, params)?;
        let ops = Operands {
            input: dx,
            weights: w,
            output: dy,
            workspace,
        };

        let time = match algorithm {
            ConvBwdDataAlgorithm::Gemm | ConvBwdDataAlgorithm::TransposeGemm => {
                if (algorithm == ConvBwdDataAlgorithm::TransposeGemm) != params.is_transpose() {
                    return Err(Error::bad_param(format!(
                        "{} does not match convolution mode {}",
                        name,
                        params.mode()
                    )));
                }
                self.dispatch_gemm(Direction::BackwardData, name, params, &ops)?
            }
            ConvBwdDataAlgorithm::Direct => self.dispatch_direct(name, &key, dy, w, dx)?,
            ConvBwdDataAlgorithm::Winograd => {
                self.dispatch_winograd(name, &key, WINOGRAD_BWD_DATA_FLAGS, dy, w, dx)?
            }
            ConvBwdDataAlgorithm::Fft => {
                let problem = ProblemDescription::new(
                    Direction::BackwardData,
                    dx.desc,
                    w.desc,
                    dy.desc,
                    params,
                );
                self.dispatch_fft(name, &key, &problem, &ops, dy, dx)?
            }
        };
        debug!("{} ran {} in {} ms", name, key, time);

        self.check_output(dx)
    }

    /// Compute `dw` from `dy` and `x` with an algorithm found by
    /// [`ConvolutionContext::find_backward_weights`]
    #[allow(clippy::too_many_arguments)]
    pub fn backward_weights(
        &mut self,
        params: &ConvParams,
        alpha: f32,
        dy: TensorArg<'_>,
        x: TensorArg<'_>,
        algorithm: ConvBwdWeightsAlgorithm,
        beta: f32,
        dw: TensorArg<'_>,
        workspace: Option<&DeviceBuffer>,
    ) -> Result<()> {
        validate_problem(params, x, dw, dy)?;
        check_scaling(alpha, beta)?;
        self.check_inputs(&[dy, x])?;

        let name = algorithm.name();
        only_gemm_in_transpose_mode(params, algorithm == ConvBwdWeightsAlgorithm::Gemm, name)?;
        let key =
            ConfigFingerprint::new(Direction::BackwardWeights, x.desc, dw.desc, dy.desc, params)?;
        let ops = Operands {
            input: x,
            weights: dw,
            output: dy,
            workspace,
        };

        let time = match algorithm {
            ConvBwdWeightsAlgorithm::Gemm => {
                if !self.gemm_available(dw.desc.data_type()) {
                    return Err(Error::NotImplemented("GEMM is not supported".to_string()));
                }
                // the multiply accumulates into dw sample by sample
                let mut fill = Launcher::new(&mut self.device);
                set_tensor(&mut fill, dw.desc, dw.buffer.arg(), 0.0f32)?;
                fill.finish();
                self.dispatch_gemm(Direction::BackwardWeights, name, params, &ops)?
            }
            ConvBwdWeightsAlgorithm::Direct => {
                if !params.is_bwd_weights_direct_applicable(dw.desc) {
                    return Err(Error::bad_param(format!(
                        "{} does not apply to filter {}",
                        name, dw.desc
                    )));
                }
                let required = self.direct_weights_workspace(params, &ops)?;
                let kernels = cached_kernels(&self.device, name, &key)?;
                let mut launcher = Launcher::new(&mut self.device);
                with_scalar_type!(dy.desc.data_type(), T => {
                    run_backward_weights_direct::<T>(&mut launcher, &kernels, &ops, required)
                })?;
                launcher.finish()
            }
        };
        debug!("{} ran {} in {} ms", name, key, time);

        self.check_output(dw)
    }

    /// Largest workspace any backward-weights direct variant asks for
    fn direct_weights_workspace(
        &self,
        params: &ConvParams,
        ops: &Operands<'_>,
    ) -> Result<usize> {
        let solver = self.backends.backward_weights.as_deref().ok_or_else(|| {
            Error::NotImplemented("Direct backward weights is not supported".to_string())
        })?;
        let problem = ProblemDescription::new(
            Direction::BackwardWeights,
            ops.input.desc,
            ops.weights.desc,
            ops.output.desc,
            params,
        );
        backward_weights_direct_workspace(solver, &self.device.info(), &problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_must_be_identity() {
        assert!(check_scaling(1.0, 0.0).is_ok());
        assert!(matches!(
            check_scaling(2.0, 0.0),
            Err(Error::NotImplemented(_))
        ));
        assert!(matches!(
            check_scaling(1.0, 1.0),
            Err(Error::NotImplemented(_))
        ));
    }
}
