//! Benchmark-driven algorithm search
//!
//! Every applicable strategy is compiled, run once against a scratch
//! destination with device timing enabled, and ranked by measured time.
//! Candidates are tried in a fixed order (GEMM, Winograd, direct, FFT); a
//! candidate that cannot be built is dropped without failing the search.
//! Only the winner is remembered in the find cache.

use log::{debug, info, trace};

use crate::conv::algorithm::{
    rank, AlgorithmCandidate, ConvAlgorithm, ConvBwdDataAlgorithm, ConvBwdWeightsAlgorithm,
    ConvFwdAlgorithm, PerfResult, StrategyFamily,
};
use crate::conv::fingerprint::ConfigFingerprint;
use crate::conv::gemm::GemmPath;
use crate::conv::invoke::{
    backward_weights_direct_workspace, compile_solution, gemm_setup, run_backward_weights_direct,
    run_direct, run_fft, run_winograd, with_scalar_type, GemmPlan, Launcher, Operands,
    WINOGRAD_BWD_DATA_FLAGS,
};
use crate::conv::params::ConvParams;
use crate::device::{Device, DeviceInfo, Kernel, KernelArg, ProfilingScope};
use crate::error::{Error, Result};
use crate::execution::cache::DirectionCache;
use crate::execution::context::{ContextOptions, ConvolutionContext};
use crate::solver::{Backends, ConvSolution, Direction, ProblemDescription, Solver};
use crate::tensor::{DeviceBuffer, TensorArg};

/// Settings for one search call
#[derive(Debug, Clone, Copy)]
pub struct FindOptions<'a> {
    /// How many ranked results to return
    pub request_count: usize,
    /// Caller scratch; workspace-bearing candidates are only timed when it is large enough
    pub workspace: Option<&'a DeviceBuffer>,
    /// Let solvers tune exhaustively instead of using their defaults
    pub exhaustive: bool,
}

impl Default for FindOptions<'_> {
    fn default() -> Self {
        Self {
            request_count: 1,
            workspace: None,
            exhaustive: false,
        }
    }
}

impl<'a> FindOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_request_count(mut self, request_count: usize) -> Self {
        self.request_count = request_count;
        self
    }

    pub fn set_workspace(mut self, workspace: &'a DeviceBuffer) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn enable_exhaustive(mut self, exhaustive: bool) -> Self {
        self.exhaustive = exhaustive;
        self
    }
}

fn check_buffer(name: &str, tensor: TensorArg<'_>) -> Result<()> {
    let needed = tensor.desc.element_space() * tensor.desc.data_type().size_in_bytes();
    if needed == 0 {
        return Err(Error::bad_param(format!("{} {} is empty", name, tensor.desc)));
    }
    if tensor.buffer.size() < needed {
        return Err(Error::bad_param(format!(
            "{} {} needs {} bytes, buffer holds {}",
            name,
            tensor.desc,
            needed,
            tensor.buffer.size()
        )));
    }
    Ok(())
}

/// Rank, type, batch, channel and buffer-size consistency of a problem
///
/// `input` is x or dx, `weights` is w or dw, `output` is y or dy.
pub(crate) fn validate_problem(
    params: &ConvParams,
    input: TensorArg<'_>,
    weights: TensorArg<'_>,
    output: TensorArg<'_>,
) -> Result<()> {
    let (in_n, in_c, _, _) = input.desc.dims4()?;
    let (wei_k, wei_c, _, _) = weights.desc.dims4()?;
    let (out_n, out_c, _, _) = output.desc.dims4()?;

    let data_type = input.desc.data_type();
    if weights.desc.data_type() != data_type || output.desc.data_type() != data_type {
        return Err(Error::bad_param(format!(
            "Tensor types do not match: {}, {}, {}",
            input.desc, weights.desc, output.desc
        )));
    }
    if in_n != out_n {
        return Err(Error::bad_param(format!(
            "Batch sizes do not match: {} and {}",
            in_n, out_n
        )));
    }

    let (expected_in, expected_out) = if params.is_transpose() {
        (wei_k, wei_c)
    } else {
        (wei_c, wei_k)
    };
    if in_c != expected_in || out_c != expected_out {
        return Err(Error::bad_param(format!(
            "Channels do not match for the filter {}: input has {}, output has {}",
            weights.desc, in_c, out_c
        )));
    }

    check_buffer("Input", input)?;
    check_buffer("Weights", weights)?;
    check_buffer("Output", output)
}

/// Measured time and workspace of a candidate, `None` when it does not apply
type Measured = Option<(f32, usize)>;

/// One search in progress: the device under a profiling scope, the operands
/// with the destination swapped for scratch, and the candidates so far
struct Probe<'p> {
    device: &'p mut dyn Device,
    info: DeviceInfo,
    backends: &'p Backends,
    options: &'p ContextOptions,
    direction: Direction,
    key: &'p ConfigFingerprint,
    params: &'p ConvParams,
    ops: Operands<'p>,
    exhaustive: bool,
    candidates: Vec<AlgorithmCandidate>,
}

impl<'p> Probe<'p> {
    fn problem(&self) -> ProblemDescription<'p> {
        ProblemDescription::new(
            self.direction,
            self.ops.input.desc,
            self.ops.weights.desc,
            self.ops.output.desc,
            self.params,
        )
    }

    /// Source and destination of a data-side strategy
    fn src_dst(&self) -> (KernelArg, KernelArg) {
        let (input, output) = (self.ops.input.buffer.arg(), self.ops.output.buffer.arg());
        match self.direction {
            Direction::BackwardData => (output, input),
            _ => (input, output),
        }
    }

    /// Keep a measured candidate, drop a demoted one, propagate anything fatal
    fn record<A: ConvAlgorithm>(&mut self, algorithm: A, outcome: Result<Measured>) -> Result<()> {
        match outcome {
            Ok(Some((time, workspace))) => {
                debug!(
                    "{}: {} ms with {} bytes of workspace",
                    algorithm, time, workspace
                );
                self.candidates
                    .push(AlgorithmCandidate::new(algorithm, time, workspace));
                Ok(())
            }
            Ok(None) => {
                trace!("{} does not apply to {}", algorithm, self.key);
                Ok(())
            }
            Err(e) if e.demotes_candidate() => {
                debug!("Dropping {} for {}: {}", algorithm, self.key, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn build<S: Solver + ?Sized>(
        &mut self,
        solver: &S,
        algorithm: &str,
    ) -> Result<(ConvSolution, Vec<Kernel>)> {
        let problem = self.problem();
        let solution = solver.solve(&self.info, &problem, self.exhaustive)?;
        let kernels = compile_solution(&mut *self.device, algorithm, self.key, &solution)?;
        trace!(
            "{} compiled {} pass(es) for {}",
            algorithm,
            solution.passes(),
            self.key
        );
        Ok((solution, kernels))
    }

    fn gemm(&mut self, algorithm: &str) -> Result<Measured> {
        let backends = self.backends;
        let backend = match backends.gemm.as_deref() {
            Some(backend) => backend,
            None => return Ok(None),
        };
        let (path, geometry, run) = gemm_setup(self.direction, self.params, &self.ops)?;
        let time_limit = if path == GemmPath::TransposeCnhw {
            self.options.gemm_transpose_time_limit
        } else {
            self.options.gemm_time_limit
        };
        let kernel = geometry.find_solution(&mut *self.device, backend, algorithm, time_limit)?;
        let plan = GemmPlan {
            path,
            geometry,
            kernel,
        };

        // per-sample paths are timed on one sample and scaled to the batch
        let batch = self.ops.batch()?;
        let mut launcher = Launcher::new(&mut *self.device);
        let workspace = run(&mut launcher, self.params, &plan, &self.ops, 1)?;
        let time = launcher.finish();
        let time = if plan.is_whole_batch() {
            time
        } else {
            time * batch as f32
        };
        Ok(Some((time, workspace)))
    }

    fn winograd(&mut self, algorithm: &str, flags: i32) -> Result<Measured> {
        let backends = self.backends;
        let solver = match backends.winograd.as_deref() {
            Some(solver) => solver,
            None => return Ok(None),
        };
        let (_, kernels) = self.build(solver, algorithm)?;
        let kernel = kernels
            .first()
            .ok_or_else(|| Error::bad_param("Winograd solution has no kernels"))?;
        let (src, dst) = self.src_dst();
        let weights = self.ops.weights.buffer.arg();

        let mut launcher = Launcher::new(&mut *self.device);
        run_winograd(&mut launcher, kernel, flags, src, weights, dst)?;
        Ok(Some((launcher.finish(), 0)))
    }

    fn direct(&mut self, algorithm: &str) -> Result<Measured> {
        let backends = self.backends;
        let solver = match backends.direct.as_deref() {
            Some(solver) => solver,
            None => return Ok(None),
        };
        let (solution, kernels) = self.build(solver, algorithm)?;
        let (src, dst) = self.src_dst();
        let weights = self.ops.weights.buffer.arg();

        let mut launcher = Launcher::new(&mut *self.device);
        with_scalar_type!(self.ops.input.desc.data_type(), T => {
            run_direct::<T>(&mut launcher, &kernels, src, weights, dst)
        })?;
        Ok(Some((launcher.finish(), solution.workspace)))
    }

    fn backward_weights_direct(&mut self, algorithm: &str) -> Result<Measured> {
        let backends = self.backends;
        let solver = match backends.backward_weights.as_deref() {
            Some(solver) => solver,
            None => return Ok(None),
        };
        // the bound dispatch checks against, not the chosen variant's own
        let required = backward_weights_direct_workspace(solver, &self.info, &self.problem())?;
        let (_, kernels) = self.build(solver, algorithm)?;
        let ops = self.ops;

        let mut launcher = Launcher::new(&mut *self.device);
        with_scalar_type!(ops.input.desc.data_type(), T => {
            run_backward_weights_direct::<T>(&mut launcher, &kernels, &ops, required)
        })?;
        Ok(Some((launcher.finish(), required)))
    }

    fn fft(&mut self, algorithm: &str) -> Result<Measured> {
        let backends = self.backends;
        let solver = match backends.fft.as_deref() {
            Some(solver) => solver,
            None => return Ok(None),
        };
        let required = solver.workspace_size(&self.problem())?;
        if required == 0 {
            return Ok(None);
        }
        let workspace = match self.ops.workspace {
            Some(ws) if ws.size() >= required => ws,
            _ => {
                debug!(
                    "FFT needs {} bytes of workspace, {} supplied",
                    required,
                    self.ops.workspace_size()
                );
                return Ok(None);
            }
        };
        let (_, kernels) = self.build(solver, algorithm)?;
        let (src, dst) = self.src_dst();
        let weights = self.ops.weights.buffer.arg();

        let mut launcher = Launcher::new(&mut *self.device);
        run_fft(&mut launcher, &kernels, src, weights, dst, workspace)?;
        Ok(Some((launcher.finish(), required)))
    }
}

fn check_request(options: &FindOptions<'_>) -> Result<()> {
    if options.request_count == 0 {
        return Err(Error::bad_param("At least one result must be requested"));
    }
    Ok(())
}

/// The cached winner, when a single result is asked for
fn cached_winner<A: ConvAlgorithm>(
    cache: &DirectionCache<A>,
    key: &ConfigFingerprint,
    options: &FindOptions<'_>,
) -> Option<A> {
    if options.request_count != 1 {
        return None;
    }
    let algorithm = cache.algorithm(key)?;
    debug!("Find cache hit for {}: {}", key, algorithm);
    Some(algorithm)
}

/// A cache hit reports neither time nor workspace
fn hit<A: ConvAlgorithm>(algorithm: A) -> Vec<PerfResult<A>> {
    vec![PerfResult {
        algorithm,
        time: 0.0,
        memory: 0,
    }]
}

fn conclude<A: ConvAlgorithm>(
    cache: &mut DirectionCache<A>,
    key: ConfigFingerprint,
    candidates: Vec<AlgorithmCandidate>,
    request_count: usize,
) -> Result<Vec<PerfResult<A>>> {
    if candidates.is_empty() {
        return Err(Error::NoViableAlgorithm(format!(
            "no {} strategy could run {}",
            A::DIRECTION,
            key
        )));
    }
    let ranked = rank::<A>(candidates, request_count)?;
    if let Some(best) = ranked.first() {
        info!(
            "Selected {} for {} ({} ms, {} bytes)",
            best.algorithm, key, best.time, best.memory
        );
        cache.insert_algorithm(key, best.algorithm);
    }
    Ok(ranked)
}

impl<D: Device> ConvolutionContext<D> {
    /// Compile a cached winner's kernels if the device holds none for it,
    /// as in a context whose cache was loaded from disk. Nothing is launched.
    fn restore_kernels<A: ConvAlgorithm>(
        &mut self,
        algorithm: A,
        key: &ConfigFingerprint,
        params: &ConvParams,
        ops: &Operands<'_>,
        exhaustive: bool,
    ) -> Result<()> {
        let direction = A::DIRECTION;
        let name = algorithm.name();
        if algorithm.family() == StrategyFamily::Gemm {
            let backend = self
                .backends
                .gemm
                .as_deref()
                .ok_or_else(|| Error::NotImplemented("GEMM is not supported".to_string()))?;
            let (path, geometry, _) = gemm_setup(direction, params, ops)?;
            if geometry.kernel(&self.device, name).is_ok() {
                return Ok(());
            }
            let time_limit = if path == GemmPath::TransposeCnhw {
                self.options.gemm_transpose_time_limit
            } else {
                self.options.gemm_time_limit
            };
            geometry.find_solution(&mut self.device, backend, name, time_limit)?;
            debug!("Rebuilt {} for {}", name, key);
            return Ok(());
        }

        if !self.device.kernels(name, key.as_str()).is_empty() {
            return Ok(());
        }
        let info = self.device.info();
        let problem = ProblemDescription::new(
            direction,
            ops.input.desc,
            ops.weights.desc,
            ops.output.desc,
            params,
        );
        let solution = match (algorithm.family(), direction) {
            (StrategyFamily::Winograd, _) => self
                .backends
                .winograd
                .as_deref()
                .map(|solver| solver.solve(&info, &problem, exhaustive)),
            (StrategyFamily::Fft, _) => self
                .backends
                .fft
                .as_deref()
                .map(|solver| solver.solve(&info, &problem, exhaustive)),
            (_, Direction::BackwardWeights) => self
                .backends
                .backward_weights
                .as_deref()
                .map(|solver| solver.solve(&info, &problem, exhaustive)),
            _ => self
                .backends
                .direct
                .as_deref()
                .map(|solver| solver.solve(&info, &problem, exhaustive)),
        }
        .ok_or_else(|| Error::NotImplemented(format!("No solver builds {}", name)))??;
        compile_solution(&mut self.device, name, key, &solution)?;
        debug!("Rebuilt {} ({} pass(es)) for {}", name, solution.passes(), key);
        Ok(())
    }

    /// Time the probes in `run` against a scratch copy of the destination
    fn search(
        &mut self,
        direction: Direction,
        params: &ConvParams,
        ops: Operands<'_>,
        options: &FindOptions<'_>,
        key: &ConfigFingerprint,
        run: impl FnOnce(&mut Probe<'_>) -> Result<()>,
    ) -> Result<Vec<AlgorithmCandidate>> {
        let destination = match direction {
            Direction::Forward => ops.output,
            Direction::BackwardData => ops.input,
            Direction::BackwardWeights => ops.weights,
        };
        let scratch_bytes =
            destination.desc.element_space() * destination.desc.data_type().size_in_bytes();
        let scratch = self.device.allocate(scratch_bytes)?;
        let info = self.device.info();
        trace!("Searching {} with {} bytes of scratch", key, scratch_bytes);

        let outcome = {
            let mut ops = ops;
            let scratch_arg = TensorArg::new(destination.desc, &scratch);
            match direction {
                Direction::Forward => ops.output = scratch_arg,
                Direction::BackwardData => ops.input = scratch_arg,
                Direction::BackwardWeights => ops.weights = scratch_arg,
            }

            let mut scope = ProfilingScope::new(&mut self.device);
            let mut probe = Probe {
                device: &mut *scope,
                info,
                backends: &self.backends,
                options: &self.options,
                direction,
                key,
                params,
                ops,
                exhaustive: options.exhaustive,
                candidates: Vec::new(),
            };
            run(&mut probe).map(|()| probe.candidates)
        };

        self.device.release(scratch);
        outcome
    }

    /// Rank the forward strategies for `x * w -> y`
    pub fn find_forward(
        &mut self,
        params: &ConvParams,
        x: TensorArg<'_>,
        w: TensorArg<'_>,
        y: TensorArg<'_>,
        options: &FindOptions<'_>,
    ) -> Result<Vec<PerfResult<ConvFwdAlgorithm>>> {
        check_request(options)?;
        validate_problem(params, x, w, y)?;
        let key = ConfigFingerprint::new(Direction::Forward, x.desc, w.desc, y.desc, params)?;
        let ops = Operands {
            input: x,
            weights: w,
            output: y,
            workspace: options.workspace,
        };
        if let Some(winner) = cached_winner(&self.cache.forward, &key, options) {
            self.restore_kernels(winner, &key, params, &ops, options.exhaustive)?;
            return Ok(hit(winner));
        }

        let info = self.device.info();
        let problem = ProblemDescription::new(Direction::Forward, x.desc, w.desc, y.desc, params);
        let regular = !params.is_transpose();
        let gemm = self.gemm_available(x.desc.data_type());
        let winograd = regular
            && params.has_unit_dilation()
            && self.winograd_supported(params, true, w.desc, x.desc);
        let fast_binary = winograd
            && self
                .backends
                .winograd
                .as_ref()
                .map_or(false, |solver| solver.is_fast_binary(&info, &problem));
        let direct = regular
            && self.options.direct_enabled
            && params.is_direct_supported(w.desc)
            && !fast_binary;
        let fft = regular && self.backends.fft.is_some();

        let candidates = self.search(Direction::Forward, params, ops, options, &key, |probe| {
            if gemm {
                let outcome = probe.gemm(ConvFwdAlgorithm::Gemm.name());
                probe.record(ConvFwdAlgorithm::Gemm, outcome)?;
            }
            if winograd {
                let outcome = probe.winograd(ConvFwdAlgorithm::Winograd.name(), 0);
                probe.record(ConvFwdAlgorithm::Winograd, outcome)?;
            }
            if direct {
                let outcome = probe.direct(ConvFwdAlgorithm::Direct.name());
                probe.record(ConvFwdAlgorithm::Direct, outcome)?;
            }
            if fft {
                let outcome = probe.fft(ConvFwdAlgorithm::Fft.name());
                probe.record(ConvFwdAlgorithm::Fft, outcome)?;
            }
            Ok(())
        })?;

        conclude(&mut self.cache.forward, key, candidates, options.request_count)
    }

    /// Rank the data-gradient strategies for `dy * w -> dx`
    pub fn find_backward_data(
        &mut self,
        params: &ConvParams,
        dy: TensorArg<'_>,
        w: TensorArg<'_>,
        dx: TensorArg<'_>,
        options: &FindOptions<'_>,
    ) -> Result<Vec<PerfResult<ConvBwdDataAlgorithm>>> {
        check_request(options)?;
        validate_problem(params, dx, w, dy)?;
        let key =
            ConfigFingerprint::new(Direction::BackwardData, dx.desc, w.desc, dy.desc, params)?;
        let ops = Operands {
            input: dx,
            weights: w,
            output: dy,
            workspace: options.workspace,
        };
        if let Some(winner) = cached_winner(&self.cache.backward_data, &key, options) {
            self.restore_kernels(winner, &key, params, &ops, options.exhaustive)?;
            return Ok(hit(winner));
        }

        let info = self.device.info();
        let problem =
            ProblemDescription::new(Direction::BackwardData, dx.desc, w.desc, dy.desc, params);
        let regular = !params.is_transpose();
        let gemm = self.gemm_available(dy.desc.data_type());
        let gemm_algorithm = if regular {
            ConvBwdDataAlgorithm::Gemm
        } else {
            ConvBwdDataAlgorithm::TransposeGemm
        };
        let winograd = regular
            && params.has_unit_dilation()
            && self.winograd_supported(params, false, w.desc, dy.desc);
        let fast_binary = winograd
            && self
                .backends
                .winograd
                .as_ref()
                .map_or(false, |solver| solver.is_fast_binary(&info, &problem));
        let direct = regular
            && self.options.direct_enabled
            && params.is_direct_supported(w.desc)
            && !fast_binary;
        let fft = regular && self.backends.fft.is_some();

        let candidates = self.search(Direction::BackwardData, params, ops, options, &key, |probe| {
            if gemm {
                let outcome = probe.gemm(gemm_algorithm.name());
                probe.record(gemm_algorithm, outcome)?;
            }
            if winograd {
                let outcome = probe.winograd(
                    ConvBwdDataAlgorithm::Winograd.name(),
                    WINOGRAD_BWD_DATA_FLAGS,
                );
                probe.record(ConvBwdDataAlgorithm::Winograd, outcome)?;
            }
            if direct {
                let outcome = probe.direct(ConvBwdDataAlgorithm::Direct.name());
                probe.record(ConvBwdDataAlgorithm::Direct, outcome)?;
            }
            if fft {
                let outcome = probe.fft(ConvBwdDataAlgorithm::Fft.name());
                probe.record(ConvBwdDataAlgorithm::Fft, outcome)?;
            }
            Ok(())
        })?;

        conclude(
            &mut self.cache.backward_data,
            key,
            candidates,
            options.request_count,
        )
    }

    /// Rank the weight-gradient strategies for `dy, x -> dw`
    pub fn find_backward_weights(
        &mut self,
        params: &ConvParams,
        dy: TensorArg<'_>,
        x: TensorArg<'_>,
        dw: TensorArg<'_>,
        options: &FindOptions<'_>,
    ) -> Result<Vec<PerfResult<ConvBwdWeightsAlgorithm>>> {
        check_request(options)?;
        validate_problem(params, x, dw, dy)?;
        let key =
            ConfigFingerprint::new(Direction::BackwardWeights, x.desc, dw.desc, dy.desc, params)?;
        let ops = Operands {
            input: x,
            weights: dw,
            output: dy,
            workspace: options.workspace,
        };
        if let Some(winner) = cached_winner(&self.cache.backward_weights, &key, options) {
            self.restore_kernels(winner, &key, params, &ops, options.exhaustive)?;
            return Ok(hit(winner));
        }

        let gemm = self.gemm_available(dy.desc.data_type());
        let direct = !params.is_transpose()
            && self.options.direct_enabled
            && params.is_bwd_weights_direct_applicable(dw.desc);

        let candidates =
            self.search(Direction::BackwardWeights, params, ops, options, &key, |probe| {
                if gemm {
                    let outcome = probe.gemm(ConvBwdWeightsAlgorithm::Gemm.name());
                    probe.record(ConvBwdWeightsAlgorithm::Gemm, outcome)?;
                }
                if direct {
                    let outcome =
                        probe.backward_weights_direct(ConvBwdWeightsAlgorithm::Direct.name());
                    probe.record(ConvBwdWeightsAlgorithm::Direct, outcome)?;
                }
                Ok(())
            })?;

        conclude(
            &mut self.cache.backward_weights,
            key,
            candidates,
            options.request_count,
        )
    }
}
