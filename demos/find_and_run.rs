use conv_find::device::sim::SimDevice;
use conv_find::error::Result;
use conv_find::{
    Backends, ContextOptions, ConvParams, ConvolutionContext, DataType, Device, FindOptions,
    TensorArg, TensorDesc,
};

/// Example: size the workspace, search every direction, then run the winners
fn main() -> Result<()> {
    println!("Convolution algorithm search on a simulated device");
    println!("==================================================\n");

    // Options can also come from a JSON file via ContextOptions::from_json_file
    let options = ContextOptions::new().enable_check_numerics(true);
    let mut ctx = ConvolutionContext::with_options(
        SimDevice::new("gfx906", 60),
        Backends::simulated(),
        options,
    );

    // A 3x3, pad 1 layer over 32 channels
    let params = ConvParams::new(1, 1, 1, 1, 1, 1)?;
    let x = TensorDesc::nchw(DataType::Float, 4, 32, 28, 28);
    let w = TensorDesc::nchw(DataType::Float, 64, 32, 3, 3);
    let y = params.forward_output_tensor(&x, &w)?;
    println!("x: {}  w: {}  y: {}", x, w, y);

    let ws_size = [
        ctx.forward_workspace_size(&params, &w, &x, &y)?,
        ctx.backward_data_workspace_size(&params, &w, &y, &x)?,
        ctx.backward_weights_workspace_size(&params, &y, &x, &w)?,
    ]
    .into_iter()
    .max()
    .unwrap_or(0);
    println!("Workspace covering all directions: {} bytes\n", ws_size);

    let device = ctx.device_mut();
    let bx = device.allocate(x.byte_size())?;
    let bw = device.allocate(w.byte_size())?;
    let by = device.allocate(y.byte_size())?;
    let bdx = device.allocate(x.byte_size())?;
    let bdw = device.allocate(w.byte_size())?;
    let ws = device.allocate(ws_size.max(1))?;
    let find = FindOptions::new().set_request_count(4).set_workspace(&ws);

    // Forward
    let results = ctx.find_forward(
        &params,
        TensorArg::new(&x, &bx),
        TensorArg::new(&w, &bw),
        TensorArg::new(&y, &by),
        &find,
    )?;
    println!("Forward candidates:");
    for r in &results {
        println!("  {:<28} {:>8.3} ms {:>10} bytes", r.algorithm, r.time, r.memory);
    }
    ctx.forward(
        &params,
        1.0,
        TensorArg::new(&x, &bx),
        TensorArg::new(&w, &bw),
        results[0].algorithm,
        0.0,
        TensorArg::new(&y, &by),
        Some(&ws),
    )?;

    // Backward data
    let results = ctx.find_backward_data(
        &params,
        TensorArg::new(&y, &by),
        TensorArg::new(&w, &bw),
        TensorArg::new(&x, &bdx),
        &find,
    )?;
    println!("Backward data candidates:");
    for r in &results {
        println!("  {:<28} {:>8.3} ms {:>10} bytes", r.algorithm, r.time, r.memory);
    }
    ctx.backward_data(
        &params,
        1.0,
        TensorArg::new(&y, &by),
        TensorArg::new(&w, &bw),
        results[0].algorithm,
        0.0,
        TensorArg::new(&x, &bdx),
        Some(&ws),
    )?;

    // Backward weights
    let results = ctx.find_backward_weights(
        &params,
        TensorArg::new(&y, &by),
        TensorArg::new(&x, &bx),
        TensorArg::new(&w, &bdw),
        &find,
    )?;
    println!("Backward weights candidates:");
    for r in &results {
        println!("  {:<28} {:>8.3} ms {:>10} bytes", r.algorithm, r.time, r.memory);
    }
    ctx.backward_weights(
        &params,
        1.0,
        TensorArg::new(&y, &by),
        TensorArg::new(&x, &bx),
        results[0].algorithm,
        0.0,
        TensorArg::new(&w, &bdw),
        Some(&ws),
    )?;

    // Bias gradient
    let db = TensorDesc::nchw(DataType::Float, 1, 64, 1, 1);
    let bdb = ctx.device_mut().allocate(db.byte_size())?;
    ctx.backward_bias(1.0, TensorArg::new(&y, &by), 0.0, TensorArg::new(&db, &bdb))?;

    println!("\nKernels launched: {}", ctx.device().launch_count());
    println!("Find cache:\n{}", ctx.find_cache().to_json()?);
    Ok(())
}
