use conv_find::{
    device::sim::SimDevice, Backends, ContextOptions, ConvBwdDataAlgorithm,
    ConvBwdWeightsAlgorithm, ConvFwdAlgorithm, ConvMode, ConvParams, ConvolutionContext, DataType,
    Device, DeviceBuffer, Error, FindOptions, KernelArg, PaddingMode, Status, TensorArg,
    TensorDesc,
};

fn desc(n: usize, c: usize, h: usize, w: usize) -> TensorDesc {
    TensorDesc::nchw(DataType::Float, n, c, h, w)
}

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

/// Search the forward problem, then forget the launches it made
fn find_forward_all(
    ctx: &mut ConvolutionContext<SimDevice>,
    p: &ConvParams,
    (x, w, y): (&TensorDesc, &TensorDesc, &TensorDesc),
    b: &Buffers,
    ws: Option<&DeviceBuffer>,
) {
    let mut options = FindOptions::new().set_request_count(4);
    if let Some(ws) = ws {
        options = options.set_workspace(ws);
    }
    ctx.find_forward(
        p,
        TensorArg::new(x, &b.x),
        TensorArg::new(w, &b.w),
        TensorArg::new(y, &b.y),
        &options,
    )
    .unwrap();
    ctx.device_mut().clear_launches();
}

#[test]
fn test_dispatch_without_search_is_a_usage_error() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::new(0, 0, 1, 1, 1, 1).unwrap();
    let (x, w, y) = (desc(1, 8, 32, 32), desc(16, 8, 1, 1), desc(1, 16, 32, 32));
    let b = allocate(&mut ctx, &x, &w, &y);

    for algorithm in [ConvFwdAlgorithm::Direct, ConvFwdAlgorithm::Gemm] {
        let err = ctx
            .forward(
                &p,
                1.0,
                TensorArg::new(&x, &b.x),
                TensorArg::new(&w, &b.w),
                algorithm,
                0.0,
                TensorArg::new(&y, &b.y),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::MissingKernel { .. }));
        assert_eq!(err.status(), Status::BadParam);
    }
    assert_eq!(ctx.device().launch_count(), 0);
}

#[test]
fn test_scaling_other_than_identity_is_not_implemented() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::new(0, 0, 1, 1, 1, 1).unwrap();
    let (x, w, y) = (desc(1, 8, 32, 32), desc(16, 8, 1, 1), desc(1, 16, 32, 32));
    let b = allocate(&mut ctx, &x, &w, &y);

    let err = ctx
        .forward(
            &p,
            2.0,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            ConvFwdAlgorithm::Direct,
            0.0,
            TensorArg::new(&y, &b.y),
            None,
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::NotImplemented);
}

#[test]
fn test_gemm_without_backend_is_not_implemented() {
    let mut ctx = context(Backends::simulated().without_gemm());
    let p = ConvParams::new(0, 0, 1, 1, 1, 1).unwrap();
    let (x, w, y) = (desc(1, 8, 32, 32), desc(16, 8, 1, 1), desc(1, 16, 32, 32));
    let b = allocate(&mut ctx, &x, &w, &y);

    let err = ctx
        .forward(
            &p,
            1.0,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            ConvFwdAlgorithm::Gemm,
            0.0,
            TensorArg::new(&y, &b.y),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented(ref msg) if msg == "GEMM is not supported"));
}

#[test]
fn test_im2col_gemm_runs_every_sample() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::new(1, 1, 1, 1, 1, 1).unwrap();
    let (x, w, y) = (desc(3, 3, 16, 16), desc(8, 3, 3, 3), desc(3, 8, 16, 16));
    let b = allocate(&mut ctx, &x, &w, &y);
    let size = ctx.forward_workspace_size(&p, &w, &x, &y).unwrap();
    assert!(size >= 3 * 9 * 16 * 16 * 4);
    let ws = ctx.device_mut().allocate(size).unwrap();
    find_forward_all(&mut ctx, &p, (&x, &w, &y), &b, Some(&ws));

    ctx.forward(
        &p,
        1.0,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        ConvFwdAlgorithm::Gemm,
        0.0,
        TensorArg::new(&y, &b.y),
        Some(&ws),
    )
    .unwrap();
    assert_eq!(
        ctx.device().launched_kernels(),
        vec!["Im2Col", "SimSgemm", "Im2Col", "SimSgemm", "Im2Col", "SimSgemm"]
    );
    let launches = ctx.device().launches();
    assert_eq!(launches[2].args[0], b.x.arg_at(3 * 16 * 16));
    assert_eq!(launches[5].args[2], b.y.arg_at(2 * 8 * 16 * 16));

    // the same algorithm without its workspace
    let err = ctx
        .forward(
            &p,
            1.0,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            ConvFwdAlgorithm::Gemm,
            0.0,
            TensorArg::new(&y, &b.y),
            None,
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::BadParam);
}

#[test]
fn test_pointwise_gemm_offsets_each_sample() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::new(0, 0, 1, 1, 1, 1).unwrap();
    let (x, w, y) = (desc(2, 8, 32, 32), desc(16, 8, 1, 1), desc(2, 16, 32, 32));
    let b = allocate(&mut ctx, &x, &w, &y);
    find_forward_all(&mut ctx, &p, (&x, &w, &y), &b, None);

    ctx.forward(
        &p,
        1.0,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        ConvFwdAlgorithm::Gemm,
        0.0,
        TensorArg::new(&y, &b.y),
        None,
    )
    .unwrap();
    let launches = ctx.device().launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1].args[0], b.w.arg());
    assert_eq!(launches[1].args[1], b.x.arg_at(8 * 32 * 32));
    assert_eq!(launches[1].args[2], b.y.arg_at(16 * 32 * 32));
}

#[test]
fn test_winograd_dispatch_flags_by_direction() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::new(1, 1, 1, 1, 1, 1).unwrap();
    let (x, w, y) = (desc(1, 32, 28, 28), desc(32, 32, 3, 3), desc(1, 32, 28, 28));
    let b = allocate(&mut ctx, &x, &w, &y);
    find_forward_all(&mut ctx, &p, (&x, &w, &y), &b, None);

    ctx.forward(
        &p,
        1.0,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        ConvFwdAlgorithm::Winograd,
        0.0,
        TensorArg::new(&y, &b.y),
        None,
    )
    .unwrap();
    let launch = &ctx.device().launches()[0];
    assert_eq!(launch.kernel, "WinogradConv3x3");
    assert_eq!(launch.args[6], KernelArg::Int(0));
    assert_eq!(launch.args[8], b.x.arg());
    assert_eq!(launch.args[10], b.y.arg());

    ctx.find_backward_data(
        &p,
        TensorArg::new(&y, &b.y),
        TensorArg::new(&w, &b.w),
        TensorArg::new(&x, &b.x),
        &FindOptions::new().set_request_count(4),
    )
    .unwrap();
    ctx.device_mut().clear_launches();
    ctx.backward_data(
        &p,
        1.0,
        TensorArg::new(&y, &b.y),
        TensorArg::new(&w, &b.w),
        ConvBwdDataAlgorithm::Winograd,
        0.0,
        TensorArg::new(&x, &b.x),
        None,
    )
    .unwrap();
    let launch = &ctx.device().launches()[0];
    assert_eq!(launch.args[6], KernelArg::Int(7));
    assert_eq!(launch.args[8], b.y.arg());
    assert_eq!(launch.args[10], b.x.arg());
}

#[test]
fn test_fft_dispatch_needs_its_workspace() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::new(1, 1, 1, 1, 1, 1).unwrap();
    let (x, w, y) = (desc(1, 32, 28, 28), desc(32, 32, 3, 3), desc(1, 32, 28, 28));
    let b = allocate(&mut ctx, &x, &w, &y);
    let ws = ctx.device_mut().allocate(8 << 20).unwrap();
    find_forward_all(&mut ctx, &p, (&x, &w, &y), &b, Some(&ws));

    let run = |ctx: &mut ConvolutionContext<SimDevice>, ws: Option<&DeviceBuffer>| {
        ctx.forward(
            &p,
            1.0,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            ConvFwdAlgorithm::Fft,
            0.0,
            TensorArg::new(&y, &b.y),
            ws,
        )
    };
    assert_eq!(run(&mut ctx, None).unwrap_err().status(), Status::BadParam);
    assert_eq!(ctx.device().launch_count(), 0);

    run(&mut ctx, Some(&ws)).unwrap();
    assert_eq!(
        ctx.device().launched_kernels(),
        vec!["FftTransformIn", "FftTransformWeights", "FftMultiply", "FftTransformOut"]
    );
}

#[test]
fn test_strided_backward_data_scatters_through_cnhw() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::new(0, 0, 2, 2, 1, 1).unwrap();
    let (dx, w, dy) = (desc(2, 8, 14, 14), desc(16, 8, 1, 1), desc(2, 16, 7, 7));
    let b = allocate(&mut ctx, &dx, &w, &dy);
    let size = ctx.backward_data_workspace_size(&p, &w, &dy, &dx).unwrap();
    assert_eq!(size, (2 * 8 * 7 * 7 + 2 * 16 * 7 * 7) * 4);
    let ws = ctx.device_mut().allocate(size).unwrap();

    let results = ctx
        .find_backward_data(
            &p,
            TensorArg::new(&dy, &b.y),
            TensorArg::new(&w, &b.w),
            TensorArg::new(&dx, &b.x),
            &FindOptions::new().set_request_count(4).set_workspace(&ws),
        )
        .unwrap();
    assert!(results
        .iter()
        .any(|r| r.algorithm == ConvBwdDataAlgorithm::Gemm && r.memory == size));
    ctx.device_mut().clear_launches();

    ctx.backward_data(
        &p,
        1.0,
        TensorArg::new(&dy, &b.y),
        TensorArg::new(&w, &b.w),
        ConvBwdDataAlgorithm::Gemm,
        0.0,
        TensorArg::new(&dx, &b.x),
        Some(&ws),
    )
    .unwrap();
    assert_eq!(
        ctx.device().launched_kernels(),
        vec!["SetTensor", "TransposeNCHW2CNHW", "SimSgemm", "TransposeCNHW2NCHW"]
    );
    assert_eq!(ctx.device().launches()[0].args[0], b.x.arg());
}

#[test]
fn test_backward_weights_gemm_zeroes_the_gradient_first() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::new(1, 1, 1, 1, 1, 1).unwrap();
    let (x, dw, dy) = (desc(2, 4, 8, 8), desc(4, 4, 3, 3), desc(2, 4, 8, 8));
    let b = allocate(&mut ctx, &x, &dw, &dy);
    let size = ctx.backward_weights_workspace_size(&p, &dy, &x, &dw).unwrap();
    assert_eq!(size, 4 * 9 * 8 * 8 * 4);
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

    let run = |ctx: &mut ConvolutionContext<SimDevice>, algorithm| {
        ctx.device_mut().clear_launches();
        ctx.backward_weights(
            &p,
            1.0,
            TensorArg::new(&dy, &b.y),
            TensorArg::new(&x, &b.x),
            algorithm,
            0.0,
            TensorArg::new(&dw, &b.w),
            Some(&ws),
        )
        .unwrap();
    };

    run(&mut ctx, ConvBwdWeightsAlgorithm::Gemm);
    assert_eq!(
        ctx.device().launched_kernels(),
        vec!["SetTensor", "Im2Col", "SimSgemm", "Im2Col", "SimSgemm"]
    );
    assert_eq!(ctx.device().launches()[0].args[0], b.w.arg());
    assert_eq!(ctx.device().launches()[0].args[1], KernelArg::Float(0.0));

    run(&mut ctx, ConvBwdWeightsAlgorithm::Direct);
    assert_eq!(ctx.device().launched_kernels(), vec!["WrwConvAsm"]);
}

#[test]
fn test_transpose_mode_dispatches_gemm_only() {
    let mut ctx = context(Backends::simulated());
    let p = ConvParams::with_modes(ConvMode::Transpose, PaddingMode::Default, 0, 0, 2, 2, 1, 1)
        .unwrap();
    let (x, w) = (desc(1, 8, 4, 4), desc(8, 3, 2, 2));
    let y = p.forward_output_tensor(&x, &w).unwrap();
    let b = allocate(&mut ctx, &x, &w, &y);

    let err = ctx
        .forward(
            &p,
            1.0,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            ConvFwdAlgorithm::Direct,
            0.0,
            TensorArg::new(&y, &b.y),
            None,
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::BadParam);

    // the regular GEMM id does not name the transpose-mode data gradient
    let err = ctx
        .backward_data(
            &p,
            1.0,
            TensorArg::new(&y, &b.y),
            TensorArg::new(&w, &b.w),
            ConvBwdDataAlgorithm::Gemm,
            0.0,
            TensorArg::new(&x, &b.x),
            None,
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::BadParam);
    assert_eq!(ctx.device().launch_count(), 0);
}

#[test]
fn test_numerics_check_rejects_nan_inputs() {
    let options = ContextOptions::new().enable_check_numerics(true);
    let mut ctx =
        ConvolutionContext::with_options(SimDevice::new("gfx906", 60), Backends::simulated(), options);
    let p = ConvParams::new(0, 0, 1, 1, 1, 1).unwrap();
    let (x, w, y) = (desc(1, 8, 32, 32), desc(16, 8, 1, 1), desc(1, 16, 32, 32));
    let b = allocate(&mut ctx, &x, &w, &y);
    find_forward_all(&mut ctx, &p, (&x, &w, &y), &b, None);

    // zero-initialized buffers pass
    ctx.forward(
        &p,
        1.0,
        TensorArg::new(&x, &b.x),
        TensorArg::new(&w, &b.w),
        ConvFwdAlgorithm::Direct,
        0.0,
        TensorArg::new(&y, &b.y),
        None,
    )
    .unwrap();

    let mut bytes = vec![0u8; x.byte_size()];
    bytes[4..8].copy_from_slice(&f32::NAN.to_le_bytes());
    ctx.device_mut().write_buffer(&b.x, &bytes).unwrap();
    ctx.device_mut().clear_launches();

    let err = ctx
        .forward(
            &p,
            1.0,
            TensorArg::new(&x, &b.x),
            TensorArg::new(&w, &b.w),
            ConvFwdAlgorithm::Direct,
            0.0,
            TensorArg::new(&y, &b.y),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Numerics(_)));
    assert_eq!(ctx.device().launch_count(), 0);
}

#[test]
fn test_backward_bias_checks_scaling_and_shape() {
    let mut ctx = context(Backends::simulated());
    let dy = desc(4, 16, 7, 7);
    let db = desc(1, 16, 1, 1);
    let bdy = ctx.device_mut().allocate(dy.byte_size()).unwrap();
    let bdb = ctx.device_mut().allocate(db.byte_size()).unwrap();

    let err = ctx
        .backward_bias(2.0, TensorArg::new(&dy, &bdy), 0.0, TensorArg::new(&db, &bdb))
        .unwrap_err();
    assert_eq!(err.status(), Status::NotImplemented);

    ctx.backward_bias(1.0, TensorArg::new(&dy, &bdy), 0.0, TensorArg::new(&db, &bdb))
        .unwrap();
    let launch = &ctx.device().launches()[0];
    assert_eq!(launch.kernel, "ConvBwdB");
    assert_eq!(launch.args, vec![bdy.arg(), bdb.arg()]);
}
