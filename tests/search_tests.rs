use conv_find::{
    device::sim::SimDevice,
    solver::sim::{SimDirectSolver, SimGemm, SimWinogradSolver, SimWrwSolver},
    solver::Solver,
    Backends, ContextOptions, ConvBwdDataAlgorithm, ConvBwdWeightsAlgorithm, ConvFwdAlgorithm,
    ConvMode, ConvParams, ConvSolution, ConvolutionContext, DataType, Device, DeviceBuffer,
    DeviceInfo, FindOptions, KernelArg, PaddingMode, ProblemDescription, Status, TensorArg,
    TensorDesc,
};

fn desc(n: usize, c: usize, h: usize, w: usize) -> TensorDesc {
    TensorDesc::nchw(DataType::Float, n, c, h, w)
}

// Buffers for the input, weights and output side of a problem
struct Buffers {
    x: DeviceBuffer,
    w: DeviceBuffer,
    y: DeviceBuffer,
}

fn allocate(
    ctx: &mut ConvolutionContext<SimDevice>,
    x: &TensorDesc,
    w: &TensorDesc,
    y: &TensorDesc,
) -> Buffers {
    let device = ctx.device_mut();
    Buffers {
        x: device.allocate(x.byte_size()).unwrap(),
        w: device.allocate(w.byte_size()).unwrap(),
        y: device.allocate(y.byte_size()).unwrap(),
    }
}

fn context(backends: Backends) -> ConvolutionContext<SimDevice> {
    ConvolutionContext::new(SimDevice::new("gfx906", 60), backends)
}

// 3x3 pad 1 over 32 channels: every forward family applies on gfx906
fn winograd_problem() -> (ConvParams, TensorDesc, TensorDesc, TensorDesc) {
    let params = ConvParams::new(1, 1, 1, 1, 1, 1).unwrap();
    (params, desc(1, 32, 28, 28), desc(32, 32, 3, 3), desc(1, 32, 28, 28))
}

// 1x1 without padding on a large image: pure GEMM and the 1x1 direct kernel
fn pointwise_problem() -> (ConvParams, TensorDesc, TensorDesc, TensorDesc) {
    let params = ConvParams::new(0, 0, 1, 1, 1, 1).unwrap();
    (params, desc(1, 8, 32, 32), desc(16, 8, 1, 1), desc(1, 16, 32, 32))
}

#[test]
fn test_forward_ranks_every_family_by_time() {
    let mut ctx = context(Backends::simulated());
    let (p, x, w, y) = winograd_problem();
    let b = allocate(&mut ctx, &x, &w, &y);
    let ws = ctx.device_mut().allocate(8 << 20).unwrap();

    let device = ctx.device_mut();
    device.set_kernel_cost("Im2Col", 0.5);
    device.set_kernel_cost("SimSgemm", 0.5);
    device.set_kernel_cost("WinogradConv3x3", 0.25);
    device.set_kernel_cost("DirectConv", 2.0);

    let options = FindOptions::new().set_request_count(4).set_workspace(&ws);
    let results = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &options,
        )
        .unwrap();

    let order: Vec<_> = results.iter().map(|r| r.algorithm).collect();
    assert_eq!(
        order,
        vec![
            ConvFwdAlgorithm::Winograd,
            ConvFwdAlgorithm::Gemm,
            ConvFwdAlgorithm::Direct,
            ConvFwdAlgorithm::Fft,
        ]
    );
    assert_eq!(results[0].time, 0.25);
    assert_eq!(results[0].memory, 0);
    assert_eq!(results[1].time, 1.0);
    assert_eq!(results[1].memory, 32 * 3 * 3 * 28 * 28 * 4);
    assert_eq!(results[3].time, 4.0);
    assert!(results[3].memory > 0);
}

#[test]
fn test_cache_hit_launches_nothing() {
    let mut ctx = context(Backends::simulated());
    let (p, x, w, y) = pointwise_problem();
    let b = allocate(&mut ctx, &x, &w, &y);
    let find = |ctx: &mut ConvolutionContext<SimDevice>, options: &FindOptions<'_>| {
        ctx.find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            options,
        )
        .unwrap()
    };

    let first = find(&mut ctx, &FindOptions::new());
    assert_eq!(first.len(), 1);
    assert!(first[0].time > 0.0);

    let launches = ctx.device().launch_count();
    let hit = find(&mut ctx, &FindOptions::new());
    assert_eq!(ctx.device().launch_count(), launches);
    assert_eq!(hit.len(), 1);
    assert_eq!(hit[0].algorithm, first[0].algorithm);
    assert_eq!(hit[0].time, 0.0);
    assert_eq!(hit[0].memory, 0);

    // asking for more than the winner searches again
    let all = find(&mut ctx, &FindOptions::new().set_request_count(2));
    assert_eq!(all.len(), 2);
    assert!(ctx.device().launch_count() > launches);
}

#[test]
fn test_search_is_deterministic() {
    let run = || {
        let mut ctx = context(Backends::simulated());
        let (p, x, w, y) = winograd_problem();
        let b = allocate(&mut ctx, &x, &w, &y);
        let ws = ctx.device_mut().allocate(8 << 20).unwrap();
        ctx.find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new().set_request_count(4).set_workspace(&ws),
        )
        .unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_ties_keep_discovery_order() {
    let mut ctx = context(Backends::simulated());
    let (p, x, w, y) = pointwise_problem();
    let b = allocate(&mut ctx, &x, &w, &y);

    let results = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new().set_request_count(4),
        )
        .unwrap();
    let order: Vec<_> = results.iter().map(|r| r.algorithm).collect();
    assert_eq!(order, vec![ConvFwdAlgorithm::Gemm, ConvFwdAlgorithm::Direct]);
    assert_eq!(results[0].time, results[1].time);
    assert_eq!(results[0].memory, 0);
}

#[test]
fn test_failing_candidates_are_dropped() {
    let backends = Backends::new()
        .with_gemm(SimGemm { failing: true })
        .with_direct(SimDirectSolver::default());
    let mut ctx = context(backends);
    let (p, x, w, y) = pointwise_problem();
    let b = allocate(&mut ctx, &x, &w, &y);

    let results = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new().set_request_count(4),
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].algorithm, ConvFwdAlgorithm::Direct);
}

#[test]
fn test_no_viable_algorithm() {
    let mut ctx = context(Backends::new().with_direct(SimDirectSolver::failing()));
    let (p, x, w, y) = pointwise_problem();
    let b = allocate(&mut ctx, &x, &w, &y);

    let err = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new(),
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::UnknownError);
    assert!(ctx.find_cache().is_empty());
}

#[test]
fn test_launch_failure_aborts_and_restores_device() {
    let mut ctx = context(Backends::simulated());
    let (p, x, w, y) = pointwise_problem();
    let b = allocate(&mut ctx, &x, &w, &y);
    ctx.device_mut().fail_launch_of("SimSgemm");
    let buffers = ctx.device().live_buffers();

    let err = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new(),
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::InternalError);
    assert!(!ctx.device().is_profiling_enabled());
    assert_eq!(ctx.device().live_buffers(), buffers);
}

#[test]
fn test_search_leaves_profiling_and_buffers_as_found() {
    let mut ctx = context(Backends::simulated());
    let (p, x, w, y) = pointwise_problem();
    let b = allocate(&mut ctx, &x, &w, &y);
    let buffers = ctx.device().live_buffers();

    ctx.find_forward(
        &p,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        TensorArg::new(&y, &b.y),
        &FindOptions::new(),
    )
    .unwrap();
    assert!(!ctx.device().is_profiling_enabled());
    assert_eq!(ctx.device().live_buffers(), buffers);

    // the destination is never written during search
    for launch in ctx.device().launches() {
        assert!(!launch.args.contains(&b.y.arg()));
    }
}

#[test]
fn test_strided_pointwise_needs_workspace_for_gemm() {
    let p = ConvParams::new(0, 0, 2, 2, 1, 1).unwrap();
    let (x, w) = (desc(2, 8, 14, 14), desc(16, 8, 1, 1));
    let y = p.forward_output_tensor(&x, &w).unwrap();
    assert_eq!(y.lengths(), &[2, 16, 7, 7]);

    let mut ctx = context(Backends::simulated());
    let b = allocate(&mut ctx, &x, &w, &y);
    let without = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new().set_request_count(4),
        )
        .unwrap();
    assert!(without.iter().all(|r| r.algorithm != ConvFwdAlgorithm::Gemm));

    let mut ctx = context(Backends::simulated());
    let b = allocate(&mut ctx, &x, &w, &y);
    let size = ctx.forward_workspace_size(&p, &w, &x, &y).unwrap();
    assert_eq!(size, (2 * 8 * 7 * 7 + 2 * 16 * 7 * 7) * 4);
    let ws = ctx.device_mut().allocate(size).unwrap();
    let with = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new().set_request_count(4).set_workspace(&ws),
        )
        .unwrap();
    let gemm = with
        .iter()
        .find(|r| r.algorithm == ConvFwdAlgorithm::Gemm)
        .unwrap();
    assert_eq!(gemm.memory, size);
    // whole-batch path: two transposes around one multiply, not scaled by the batch
    assert_eq!(gemm.time, 3.0);
}

#[test]
fn test_fast_binary_skips_direct() {
    let backends = Backends::simulated().with_winograd(SimWinogradSolver {
        fast_binary: true,
        rxs: false,
    });
    let mut ctx = context(backends);
    let (p, x, w, y) = winograd_problem();
    let b = allocate(&mut ctx, &x, &w, &y);

    let results = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new().set_request_count(4),
        )
        .unwrap();
    // no workspace: GEMM and FFT are skipped, direct is shadowed by the binary
    let order: Vec<_> = results.iter().map(|r| r.algorithm).collect();
    assert_eq!(order, vec![ConvFwdAlgorithm::Winograd]);
}

#[test]
fn test_disabled_direct_is_not_searched() {
    let options = ContextOptions::new().enable_direct(false);
    let mut ctx = ConvolutionContext::with_options(
        SimDevice::new("gfx906", 60),
        Backends::simulated(),
        options,
    );
    let (p, x, w, y) = pointwise_problem();
    let b = allocate(&mut ctx, &x, &w, &y);

    let results = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new().set_request_count(4),
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].algorithm, ConvFwdAlgorithm::Gemm);
    assert!(!ctx.device().launched_kernels().contains(&"DirectConv1x1Asm"));
}

#[test]
fn test_backward_data_winograd_uses_gradient_flags() {
    let mut ctx = context(Backends::simulated());
    let (p, dx, w, dy) = winograd_problem();
    let b = allocate(&mut ctx, &dx, &w, &dy);
    ctx.device_mut().set_kernel_cost("WinogradConv3x3", 0.1);

    let results = ctx
        .find_backward_data(
            &p,
            TensorArg::new(&dy, &b.y),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&dx, &b.x),
            &FindOptions::new(),
        )
        .unwrap();
    assert_eq!(results[0].algorithm, ConvBwdDataAlgorithm::Winograd);

    let winograd = ctx
        .device()
        .launches()
        .iter()
        .find(|l| l.kernel == "WinogradConv3x3")
        .unwrap();
    assert_eq!(winograd.args[6], KernelArg::Int(7));
}

#[test]
fn test_transpose_mode_searches_gemm_only() {
    let p = ConvParams::with_modes(ConvMode::Transpose, PaddingMode::Default, 0, 0, 2, 2, 1, 1)
        .unwrap();
    let (x, w) = (desc(1, 8, 4, 4), desc(8, 3, 2, 2));
    let y = p.forward_output_tensor(&x, &w).unwrap();

    let mut ctx = context(Backends::simulated());
    let b = allocate(&mut ctx, &x, &w, &y);
    let size = ctx.forward_workspace_size(&p, &w, &x, &y).unwrap();
    assert_eq!(size, 3 * 2 * 2 * 4 * 4 * 4);
    let ws = ctx.device_mut().allocate(size).unwrap();

    let forward = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new().set_request_count(4).set_workspace(&ws),
        )
        .unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].algorithm, ConvFwdAlgorithm::Gemm);
    assert_eq!(forward[0].memory, size);

    // dx has the shape of x and dy the shape of y
    let bwd_size = ctx.backward_data_workspace_size(&p, &w, &y, &x).unwrap();
    assert_eq!(bwd_size, size);
    let data = ctx
        .find_backward_data(
            &p,
            TensorArg::new(&y, &b.y),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&x, &b.x),
            &FindOptions::new().set_request_count(4).set_workspace(&ws),
        )
        .unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].algorithm, ConvBwdDataAlgorithm::TransposeGemm);
}

#[test]
fn test_backward_weights_ranks_direct_and_gemm() {
    let p = ConvParams::new(2, 2, 1, 1, 1, 1).unwrap();
    let (x, dw, dy) = (desc(16, 8, 14, 14), desc(4, 8, 5, 5), desc(16, 4, 14, 14));
    let mut ctx = context(Backends::simulated());
    let b = allocate(&mut ctx, &x, &dw, &dy);

    let size = ctx.backward_weights_workspace_size(&p, &dy, &x, &dw).unwrap();
    assert_eq!(size, 8 * 5 * 5 * 14 * 14 * 4);
    let ws = ctx.device_mut().allocate(size).unwrap();

    let results = ctx
        .find_backward_weights(
            &p,
            TensorArg::new(&dy, &b.y),
            TensorArg::new(&x, &b.x),
            TensorArg::new(&dw, &b.w),
            &FindOptions::new().set_request_count(2).set_workspace(&ws),
        )
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].algorithm, ConvBwdWeightsAlgorithm::Direct);
    assert_eq!(results[0].time, 2.0);
    assert_eq!(results[0].memory, 4 * 8 * 5 * 5 * 4 * 8);
    assert_eq!(results[1].algorithm, ConvBwdWeightsAlgorithm::Gemm);
    // timed on one sample, scaled to the batch of 16
    assert_eq!(results[1].time, 32.0);
}

#[test]
fn test_backward_weights_without_direct_solver() {
    let p = ConvParams::new(1, 1, 1, 1, 1, 1).unwrap();
    let (x, dw, dy) = (desc(2, 4, 8, 8), desc(4, 4, 3, 3), desc(2, 4, 8, 8));
    let backends = Backends::new()
        .with_backward_weights(SimWrwSolver { failing: true })
        .with_gemm(SimGemm::default());
    let mut ctx = context(backends);
    let b = allocate(&mut ctx, &x, &dw, &dy);
    let size = ctx.backward_weights_workspace_size(&p, &dy, &x, &dw).unwrap();
    let ws = ctx.device_mut().allocate(size).unwrap();

    let results = ctx
        .find_backward_weights(
            &p,
            TensorArg::new(&dy, &b.y),
            TensorArg::new(&x, &b.x),
            TensorArg::new(&dw, &b.w),
            &FindOptions::new().set_request_count(2).set_workspace(&ws),
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].algorithm, ConvBwdWeightsAlgorithm::Gemm);
}

#[test]
fn test_find_cache_survives_save_and_load() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("find_cache.json");
    let (p, x, w, y) = pointwise_problem();

    let mut ctx = context(Backends::simulated());
    let b = allocate(&mut ctx, &x, &w, &y);
    let found = ctx.find_forward(
        &p,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        TensorArg::new(&y, &b.y),
        &FindOptions::new(),
    )?;
    ctx.save_find_cache(&path)?;

    let mut restored = context(Backends::simulated());
    assert!(restored.load_find_cache(&path)? > 0);
    let b = allocate(&mut restored, &x, &w, &y);
    let hit = restored.find_forward(
        &p,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        TensorArg::new(&y, &b.y),
        &FindOptions::new(),
    )?;
    assert_eq!(hit[0].algorithm, found[0].algorithm);
    assert_eq!(restored.device().launch_count(), 0);

    // the hit rebuilt the winner's kernels, so dispatch finds them
    let size = restored.forward_workspace_size(&p, &w, &x, &y)?;
    let ws = restored.device_mut().allocate(size.max(1))?;
    restored.forward(
        &p,
        1.0,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        hit[0].algorithm,
        0.0,
        TensorArg::new(&y, &b.y),
        Some(&ws),
    )?;
    assert!(restored.device().launch_count() > 0);
    Ok(())
}

#[test]
fn test_loaded_direct_winner_dispatches_without_research() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("find_cache.json");
    let (p, x, w, y) = pointwise_problem();
    let direct_only = || Backends::new().with_direct(SimDirectSolver::default());

    let mut ctx = context(direct_only());
    let b = allocate(&mut ctx, &x, &w, &y);
    let found = ctx.find_forward(
        &p,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        TensorArg::new(&y, &b.y),
        &FindOptions::new(),
    )?;
    assert_eq!(found[0].algorithm, ConvFwdAlgorithm::Direct);
    ctx.save_find_cache(&path)?;

    let mut restored = context(direct_only());
    restored.load_find_cache(&path)?;
    let b = allocate(&mut restored, &x, &w, &y);
    let hit = restored.find_forward(
        &p,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        TensorArg::new(&y, &b.y),
        &FindOptions::new(),
    )?;
    assert_eq!(hit[0].time, 0.0);
    assert_eq!(restored.device().launch_count(), 0);
    let compiled = restored.device().compilation_count();
    assert!(compiled > 0);

    // a second hit finds the kernels already built
    restored.find_forward(
        &p,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        TensorArg::new(&y, &b.y),
        &FindOptions::new(),
    )?;
    assert_eq!(restored.device().compilation_count(), compiled);

    restored.forward(
        &p,
        1.0,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        ConvFwdAlgorithm::Direct,
        0.0,
        TensorArg::new(&y, &b.y),
        None,
    )?;
    Ok(())
}

// Reports a larger variant alongside the one it builds
#[derive(Debug, Default)]
struct WrwWithLargerVariant(SimWrwSolver);

impl Solver for WrwWithLargerVariant {
    fn solve(
        &self,
        device: &DeviceInfo,
        problem: &ProblemDescription<'_>,
        exhaustive: bool,
    ) -> conv_find::Result<ConvSolution> {
        self.0.solve(device, problem, exhaustive)
    }

    fn solutions(
        &self,
        device: &DeviceInfo,
        problem: &ProblemDescription<'_>,
    ) -> conv_find::Result<Vec<ConvSolution>> {
        let built = self.0.solve(device, problem, false)?;
        let mut larger = built.clone();
        larger.workspace += 4096;
        Ok(vec![built, larger])
    }
}

#[test]
fn test_backward_weights_direct_reports_dispatch_workspace() {
    // 5x5 goes through the partial-sum kernel and its reduction
    let p = ConvParams::new(2, 2, 1, 1, 1, 1).unwrap();
    let (x, dw, dy) = (desc(2, 4, 8, 8), desc(4, 4, 5, 5), desc(2, 4, 8, 8));
    let mut ctx = context(Backends::new().with_backward_weights(WrwWithLargerVariant::default()));
    let b = allocate(&mut ctx, &x, &dw, &dy);
    let size = ctx.backward_weights_workspace_size(&p, &dy, &x, &dw).unwrap();
    let ws = ctx.device_mut().allocate(size).unwrap();

    let results = ctx
        .find_backward_weights(
            &p,
            TensorArg::new(&dy, &b.y),
            TensorArg::new(&x, &b.x),
            TensorArg::new(&dw, &b.w),
            &FindOptions::new().set_workspace(&ws),
        )
        .unwrap();
    assert_eq!(results[0].algorithm, ConvBwdWeightsAlgorithm::Direct);
    assert_eq!(results[0].memory, size);

    let exact = ctx.device_mut().allocate(results[0].memory).unwrap();
    ctx.backward_weights(
        &p,
        1.0,
        TensorArg::new(&dy, &b.y),
        TensorArg::new(&x, &b.x),
        results[0].algorithm,
        0.0,
        TensorArg::new(&dw, &b.w),
        Some(&exact),
    )
    .unwrap();
    let launched = ctx.device().launched_kernels();
    assert_eq!(launched[launched.len() - 2..], ["WrwConv", "WrwReduce"]);
}

#[test]
fn test_validation_rejects_before_searching() {
    let mut ctx = context(Backends::simulated());
    let (p, x, w, _) = pointwise_problem();
    let y = desc(1, 4, 32, 32);
    let b = allocate(&mut ctx, &x, &w, &y);

    let err = ctx
        .find_forward(
            &p,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&y, &b.y),
            &FindOptions::new(),
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::BadParam);
    assert_eq!(ctx.device().launch_count(), 0);
}
