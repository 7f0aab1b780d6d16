//! Bias gradient: one sum per output channel over batch and spatial extent

use log::debug;

use crate::conv::dispatch::check_scaling;
use crate::device::{Device, KernelAbi, KernelInfo};
use crate::error::{Error, Result};
use crate::execution::context::ConvolutionContext;
use crate::tensor::{DataType, TensorArg, TensorDesc};

const BIAS_ALGORITHM: &str = "conv_bwd_bias";
const GROUP_SIZE: usize = 256;
const LOCAL_MEMORY: usize = 256;
const READ_UNIT: usize = 4;

/// Launch description of the reduction for `dy`
fn bias_kernel(dy: &TensorDesc) -> Result<KernelInfo> {
    let (out_n, out_c, out_h, out_w) = dy.dims4()?;
    let (stride_n, stride_c, _, _) = dy.strides4()?;

    let map_size = out_w * out_h;
    let map_size_aligned = (map_size + READ_UNIT - 1) / READ_UNIT;
    let off_pix = map_size - (map_size / READ_UNIT) * READ_UNIT;
    let (fp16, fp32) = match dy.data_type() {
        DataType::Half => (1, 0),
        DataType::Float => (0, 1),
        other => {
            return Err(Error::NotImplemented(format!(
                "Bias gradient for {} tensors",
                other
            )))
        }
    };

    let options = [
        format!("-DMLO_CONVBWD_GROUP_SZ0={}", GROUP_SIZE),
        "-DMLO_CONVBWD_GROUP_SZ1=1".to_string(),
        format!("-DMLO_CONVBWDB_LCL_MEMSZ={}", LOCAL_MEMORY),
        format!("-DMLO_CONVBWDB_UNITSIZE={}", READ_UNIT),
        format!("-DMLO_OUT_WIDTH={}", out_w),
        format!("-DMLO_OUT_HEIGHT={}", out_h),
        format!("-DMLO_OUT_BATCH_SZ={}", out_n),
        format!("-DMLO_OUT_CHANNEL_STRIDE={}", stride_c),
        format!("-DMLO_OUT_BATCH_STRIDE={}", stride_n),
        format!("-DMLO_WK_SIZE={}", map_size_aligned),
        format!("-DMLO_N_PIX_OFF={}", off_pix),
        format!("-DCONV_USE_FP16={}", fp16),
        format!("-DCONV_USE_FP32={}", fp32),
    ]
    .join(" ");

    Ok(KernelInfo::new("ConvBwdB", "ConvBwdBias.cl", KernelAbi::Utility)
        .with_options(options)
        .with_geometry(vec![GROUP_SIZE, 1, 1], vec![GROUP_SIZE, out_c, 1]))
}

impl<D: Device> ConvolutionContext<D> {
    /// Reduce `dy` into `db`, one value per output channel
    pub fn backward_bias(
        &mut self,
        alpha: f32,
        dy: TensorArg<'_>,
        beta: f32,
        db: TensorArg<'_>,
    ) -> Result<()> {
        let (_, out_c, _, _) = dy.desc.dims4()?;
        let (_, bias_c, _, _) = db.desc.dims4()?;
        if out_c != bias_c {
            return Err(Error::bad_param(format!(
                "Bias {} does not match the {} channels of {}",
                db.desc, out_c, dy.desc
            )));
        }
        if dy.desc.data_type() != db.desc.data_type() {
            return Err(Error::bad_param("Types do not match for the bias"));
        }
        check_scaling(alpha, beta)?;
        if self.options.check_numerics {
            self.numerics.check(&self.device, dy)?;
        }

        let info = bias_kernel(dy.desc)?;
        let config = format!("{}-{:?}", dy.desc, dy.desc.strides());
        let kernel = self.device.add_kernel(BIAS_ALGORITHM, &config, &info, 0)?;
        self.device
            .launch(&kernel, &[dy.buffer.arg(), db.buffer.arg()])?;
        debug!("Bias gradient of {} into {}", dy.desc, db.desc);

        if self.options.check_numerics {
            self.numerics.check(&self.device, db)?;
        }
        Ok(())
    }
}
