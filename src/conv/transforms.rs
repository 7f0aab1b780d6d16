//! Layout helpers launched around GEMM kernels
//!
//! Each helper compiles its kernel on first use, keyed by the geometry it
//! was built for, and fetches it from the device cache afterwards.

use crate::conv::invoke::Launcher;
use crate::conv::params::ConvParams;
use crate::device::{Kernel, KernelAbi, KernelArg, KernelInfo};
use crate::error::Result;
use crate::tensor::{DataType, DeviceScalar, TensorDesc};

fn utility_kernel(l: &mut Launcher<'_>, name: &str, config: &str) -> Result<Kernel> {
    let info = KernelInfo::new(name, format!("{}.cl", name), KernelAbi::Utility);
    l.device().add_kernel(name, config, &info, 0)
}

/// Image and column-grid extents for im2col / col2im
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColLayout {
    pub channels: usize,
    /// Extent of the image side
    pub height: usize,
    pub width: usize,
    pub filter_h: usize,
    pub filter_w: usize,
    /// Extent of the column grid (one column per filter position)
    pub out_h: usize,
    pub out_w: usize,
    pub data_type: DataType,
}

impl ColLayout {
    /// Layout for `image` unrolled over a `filter_h x filter_w` window onto `grid`'s extent
    pub(crate) fn new(image: &TensorDesc, filter: &TensorDesc, grid: &TensorDesc) -> Result<Self> {
        let (_, channels, height, width) = image.dims4()?;
        let (_, _, filter_h, filter_w) = filter.dims4()?;
        let (_, _, out_h, out_w) = grid.dims4()?;
        Ok(Self {
            channels,
            height,
            width,
            filter_h,
            filter_w,
            out_h,
            out_w,
            data_type: image.data_type(),
        })
    }

    /// Bytes of the column buffer
    pub(crate) fn col_bytes(&self) -> usize {
        self.channels
            * self.filter_h
            * self.filter_w
            * self.out_h
            * self.out_w
            * self.data_type.size_in_bytes()
    }

    fn config(&self, params: &ConvParams) -> String {
        format!(
            "c{}-{}x{}-k{}x{}-o{}x{}-p{}x{}-s{}x{}-d{}x{}-{}",
            self.channels,
            self.height,
            self.width,
            self.filter_h,
            self.filter_w,
            self.out_h,
            self.out_w,
            params.pad_h(),
            params.pad_w(),
            params.stride_h(),
            params.stride_w(),
            params.dilation_h(),
            params.dilation_w(),
            self.data_type.tag()
        )
    }

    fn geometry_args(&self, params: &ConvParams) -> [KernelArg; 13] {
        [
            KernelArg::int(self.channels),
            KernelArg::int(self.height),
            KernelArg::int(self.width),
            KernelArg::int(self.filter_h),
            KernelArg::int(self.filter_w),
            KernelArg::int(self.out_h),
            KernelArg::int(self.out_w),
            KernelArg::int(params.pad_h()),
            KernelArg::int(params.pad_w()),
            KernelArg::int(params.stride_h()),
            KernelArg::int(params.stride_w()),
            KernelArg::int(params.dilation_h()),
            KernelArg::int(params.dilation_w()),
        ]
    }
}

/// Unroll one sample of `image` into the column buffer `col`
pub(crate) fn im2col(
    l: &mut Launcher<'_>,
    params: &ConvParams,
    layout: &ColLayout,
    image: KernelArg,
    col: KernelArg,
) -> Result<()> {
    let kernel = utility_kernel(l, "Im2Col", &layout.config(params))?;
    let mut args = vec![image];
    args.extend_from_slice(&layout.geometry_args(params));
    args.push(col);
    l.launch(&kernel, &args)
}

/// Fold the column buffer `col` back into one sample of `image`, summing overlaps
pub(crate) fn col2im(
    l: &mut Launcher<'_>,
    params: &ConvParams,
    layout: &ColLayout,
    col: KernelArg,
    image: KernelArg,
) -> Result<()> {
    let kernel = utility_kernel(l, "Col2Im", &layout.config(params))?;
    let mut args = vec![col];
    args.extend_from_slice(&layout.geometry_args(params));
    args.push(image);
    l.launch(&kernel, &args)
}

/// Whole-batch copy between NCHW and CNHW, optionally sub-sampling or
/// up-sampling the spatial extent by a stride
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchTranspose {
    pub batch: usize,
    pub channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub data_type: DataType,
}

impl BatchTranspose {
    fn config(&self) -> String {
        format!(
            "n{}c{}-{}x{}-{}x{}-s{}x{}-{}",
            self.batch,
            self.channels,
            self.in_h,
            self.in_w,
            self.out_h,
            self.out_w,
            self.stride_h,
            self.stride_w,
            self.data_type.tag()
        )
    }

    fn launch(&self, l: &mut Launcher<'_>, name: &str, src: KernelArg, dst: KernelArg) -> Result<()> {
        let kernel = utility_kernel(l, name, &self.config())?;
        l.launch(
            &kernel,
            &[
                src,
                dst,
                KernelArg::int(self.batch),
                KernelArg::int(self.channels),
                KernelArg::int(self.in_h),
                KernelArg::int(self.in_w),
                KernelArg::int(self.out_h),
                KernelArg::int(self.out_w),
                KernelArg::int(self.stride_h),
                KernelArg::int(self.stride_w),
            ],
        )
    }

    pub(crate) fn nchw_to_cnhw(&self, l: &mut Launcher<'_>, src: KernelArg, dst: KernelArg) -> Result<()> {
        self.launch(l, "TransposeNCHW2CNHW", src, dst)
    }

    pub(crate) fn cnhw_to_nchw(&self, l: &mut Launcher<'_>, src: KernelArg, dst: KernelArg) -> Result<()> {
        self.launch(l, "TransposeCNHW2NCHW", src, dst)
    }
}

/// Fill every element of `desc` in `buffer` with `value`
pub(crate) fn set_tensor<T: DeviceScalar>(
    l: &mut Launcher<'_>,
    desc: &TensorDesc,
    buffer: KernelArg,
    value: T,
) -> Result<()> {
    let config = format!("{}-{}", desc, T::DATA_TYPE.tag());
    let kernel = utility_kernel(l, "SetTensor", &config)?;
    let (n, c, h, w) = desc.dims4()?;
    let (sn, sc, sh, sw) = desc.strides4()?;
    l.launch(
        &kernel,
        &[
            buffer,
            value.into_arg(),
            KernelArg::int(n),
            KernelArg::int(c),
            KernelArg::int(h),
            KernelArg::int(w),
            KernelArg::int(sn),
            KernelArg::int(sc),
            KernelArg::int(sh),
            KernelArg::int(sw),
        ],
    )
}
