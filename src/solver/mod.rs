//! # Strategy construction interfaces
//!
//! Each convolution strategy family (direct, Winograd, backward-weights
//! direct, FFT) is built by a solver that turns a [`ProblemDescription`] into
//! a [`ConvSolution`]: the kernels to compile, their launch geometry, the
//! compiled-in parameters the launch needs, and the scratch memory the
//! solution requires. GEMM kernels come from a [`GemmBackend`].
//!
//! Solvers are pure with respect to the engine: they never touch buffers or
//! launch anything. The engine compiles what they describe.

pub mod sim;

use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::conv::gemm::GemmGeometry;
use crate::conv::params::ConvParams;
use crate::device::{CompiledInParams, DeviceInfo, KernelInfo};
use crate::error::Result;
use crate::tensor::TensorDesc;

/// Which gradient (or the forward pass) a problem computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum Direction {
    #[strum(serialize = "fwd")]
    Forward,
    #[strum(serialize = "bwd")]
    BackwardData,
    #[strum(serialize = "wrw")]
    BackwardWeights,
}

/// The three tensors of a convolution problem plus its parameters
///
/// `input` is always the activation side (x or dx) and `output` the result
/// side (y or dy), whatever the direction.
#[derive(Debug, Clone, Copy)]
pub struct ProblemDescription<'a> {
    pub direction: Direction,
    pub input: &'a TensorDesc,
    pub weights: &'a TensorDesc,
    pub output: &'a TensorDesc,
    pub params: &'a ConvParams,
}

impl<'a> ProblemDescription<'a> {
    pub fn new(
        direction: Direction,
        input: &'a TensorDesc,
        weights: &'a TensorDesc,
        output: &'a TensorDesc,
        params: &'a ConvParams,
    ) -> Self {
        Self {
            direction,
            input,
            weights,
            output,
            params,
        }
    }

    /// Geometry every solver compiles in: the input extent, output channels,
    /// and a single launch group
    pub fn compiled_in_params(&self) -> Result<CompiledInParams> {
        let (n, c, h, w) = self.input.dims4()?;
        let (_, k, _, _) = self.output.dims4()?;
        Ok(CompiledInParams {
            batch: n,
            channels: c,
            height: h,
            width: w,
            out_channels: k,
            groups: 1,
            extent: None,
        })
    }
}

/// A constructed strategy ready to be compiled
#[derive(Debug, Clone, PartialEq)]
pub struct ConvSolution {
    /// One kernel, or a main kernel followed by a second pass
    pub kernels: Vec<KernelInfo>,
    /// Scratch bytes the solution needs
    pub workspace: usize,
    pub compiled_in: CompiledInParams,
}

impl ConvSolution {
    pub fn passes(&self) -> usize {
        self.kernels.len()
    }
}

/// Builds kernels for one strategy family
pub trait Solver: Send + fmt::Debug {
    /// The solution to run for `problem`, tuned when `exhaustive` is set
    fn solve(
        &self,
        device: &DeviceInfo,
        problem: &ProblemDescription<'_>,
        exhaustive: bool,
    ) -> Result<ConvSolution>;

    /// Every variant applicable to `problem`, used for workspace sizing
    fn solutions(
        &self,
        device: &DeviceInfo,
        problem: &ProblemDescription<'_>,
    ) -> Result<Vec<ConvSolution>> {
        Ok(vec![self.solve(device, problem, false)?])
    }
}

/// Winograd solver, which also knows whether a hand-tuned binary exists
pub trait WinogradSolver: Solver {
    /// A fast binary kernel makes the direct strategy pointless for `problem`
    fn is_fast_binary(&self, device: &DeviceInfo, problem: &ProblemDescription<'_>) -> bool;
}

/// FFT solver, which sizes its own frequency-domain scratch
pub trait FftSolver: Solver {
    fn workspace_size(&self, problem: &ProblemDescription<'_>) -> Result<usize>;
}

/// Produces a tuned GEMM kernel for a geometry
pub trait GemmBackend: Send + fmt::Debug {
    /// Search for the best kernel within `time_limit` seconds of tuning
    fn find_solution(&self, geometry: &GemmGeometry, time_limit: f64) -> Result<KernelInfo>;
}

/// The strategy implementations bound to a context
///
/// Any family left as `None` is treated as unavailable: it is never searched
/// and dispatching it fails.
#[derive(Debug, Default)]
pub struct Backends {
    pub direct: Option<Box<dyn Solver>>,
    pub winograd: Option<Box<dyn WinogradSolver>>,
    pub backward_weights: Option<Box<dyn Solver>>,
    pub fft: Option<Box<dyn FftSolver>>,
    pub gemm: Option<Box<dyn GemmBackend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// All families backed by the simulated implementations
    pub fn simulated() -> Self {
        Self::new()
            .with_direct(sim::SimDirectSolver::default())
            .with_winograd(sim::SimWinogradSolver::default())
            .with_backward_weights(sim::SimWrwSolver::default())
            .with_fft(sim::SimFftSolver::default())
            .with_gemm(sim::SimGemm::default())
    }

    pub fn with_direct(mut self, solver: impl Solver + 'static) -> Self {
        self.direct = Some(Box::new(solver));
        self
    }

    pub fn with_winograd(mut self, solver: impl WinogradSolver + 'static) -> Self {
        self.winograd = Some(Box::new(solver));
        self
    }

    pub fn with_backward_weights(mut self, solver: impl Solver + 'static) -> Self {
        self.backward_weights = Some(Box::new(solver));
        self
    }

    pub fn with_fft(mut self, solver: impl FftSolver + 'static) -> Self {
        self.fft = Some(Box::new(solver));
        self
    }

    pub fn with_gemm(mut self, backend: impl GemmBackend + 'static) -> Self {
        self.gemm = Some(Box::new(backend));
        self
    }

    /// Unbind the GEMM backend
    pub fn without_gemm(mut self) -> Self {
        self.gemm = None;
        self
    }
}
