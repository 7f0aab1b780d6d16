use std::fmt;

use half::{bf16, f16};
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::device::KernelArg;
use crate::error::{Error, Result};

/// Element types a convolution tensor can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Half,
    Float,
    BFloat16,
    Int8,
}

impl DataType {
    /// Get the size in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Half => std::mem::size_of::<f16>(),
            DataType::Float => std::mem::size_of::<f32>(),
            DataType::BFloat16 => std::mem::size_of::<bf16>(),
            DataType::Int8 => 1,
        }
    }

    /// Check if data type is a floating point type
    pub fn is_floating_point(&self) -> bool {
        !matches!(self, DataType::Int8)
    }

    /// Short tag used inside configuration keys
    pub fn tag(&self) -> &'static str {
        match self {
            DataType::Half => "fp16",
            DataType::Float => "fp32",
            DataType::BFloat16 => "bf16",
            DataType::Int8 => "int8",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Shape, strides and element type of a device tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    data_type: DataType,
    lengths: Vec<usize>,
    strides: Vec<usize>,
}

impl TensorDesc {
    /// Create a packed descriptor (row-major strides)
    pub fn new(data_type: DataType, lengths: &[usize]) -> Self {
        let mut strides = vec![1; lengths.len()];
        for i in (0..lengths.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * lengths[i + 1];
        }
        Self {
            data_type,
            lengths: lengths.to_vec(),
            strides,
        }
    }

    /// Create a descriptor with explicit strides
    pub fn with_strides(data_type: DataType, lengths: &[usize], strides: &[usize]) -> Result<Self> {
        if lengths.len() != strides.len() {
            return Err(Error::bad_param(format!(
                "Lengths {:?} and strides {:?} differ in rank",
                lengths, strides
            )));
        }
        Ok(Self {
            data_type,
            lengths: lengths.to_vec(),
            strides: strides.to_vec(),
        })
    }

    /// Packed NCHW descriptor
    pub fn nchw(data_type: DataType, n: usize, c: usize, h: usize, w: usize) -> Self {
        Self::new(data_type, &[n, c, h, w])
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.lengths.len()
    }

    /// Whether the strides are the row-major packed strides of the lengths
    pub fn is_packed(&self) -> bool {
        let mut expected = 1;
        for (&len, &stride) in self.lengths.iter().zip(&self.strides).rev() {
            if stride != expected {
                return false;
            }
            expected *= len;
        }
        true
    }

    /// Number of logical elements
    pub fn element_count(&self) -> usize {
        self.lengths.iter().product()
    }

    /// Number of elements spanned in memory, including stride gaps
    pub fn element_space(&self) -> usize {
        if self.lengths.iter().any(|&l| l == 0) {
            return 0;
        }
        self.lengths
            .iter()
            .zip(&self.strides)
            .map(|(&l, &s)| (l - 1) * s)
            .sum::<usize>()
            + 1
    }

    /// Bytes needed to hold the logical elements packed
    pub fn byte_size(&self) -> usize {
        self.element_count() * self.data_type.size_in_bytes()
    }

    /// The four NCHW lengths of a rank-4 tensor
    pub fn dims4(&self) -> Result<(usize, usize, usize, usize)> {
        match self.lengths.as_slice() {
            &[n, c, h, w] => Ok((n, c, h, w)),
            other => Err(Error::bad_param(format!(
                "Expected a 4D tensor, got lengths {:?}",
                other
            ))),
        }
    }

    /// The four NCHW strides of a rank-4 tensor
    pub fn strides4(&self) -> Result<(usize, usize, usize, usize)> {
        match self.strides.as_slice() {
            &[n, c, h, w] => Ok((n, c, h, w)),
            other => Err(Error::bad_param(format!(
                "Expected a 4D tensor, got strides {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.lengths.iter().map(|l| l.to_string()).collect();
        write!(f, "{}[{}]", self.data_type, dims.join("x"))
    }
}

/// Identifier of a buffer owned by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Handle to device memory
///
/// Buffers are owned by whoever allocated them. The engine only borrows
/// caller buffers and releases the timing scratch it allocates itself.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    id: BufferId,
    size: usize,
}

impl DeviceBuffer {
    /// Wrap a device allocation. Called by `Device` implementations.
    pub fn new(id: BufferId, size: usize) -> Self {
        Self { id, size }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Kernel argument referring to the start of this buffer
    pub fn arg(&self) -> KernelArg {
        KernelArg::Buffer { id: self.id, offset: 0 }
    }

    /// Kernel argument referring to this buffer starting at `offset` elements
    pub fn arg_at(&self, offset: usize) -> KernelArg {
        KernelArg::Buffer { id: self.id, offset }
    }
}

/// A tensor descriptor together with the buffer holding its data
#[derive(Debug, Clone, Copy)]
pub struct TensorArg<'a> {
    pub desc: &'a TensorDesc,
    pub buffer: &'a DeviceBuffer,
}

impl<'a> TensorArg<'a> {
    pub fn new(desc: &'a TensorDesc, buffer: &'a DeviceBuffer) -> Self {
        Self { desc, buffer }
    }
}

/// Floating point element types kernels can be instantiated for
pub trait DeviceScalar: Copy + Zero + fmt::Debug {
    const DATA_TYPE: DataType;

    /// Pass a value of this type as a kernel argument
    fn into_arg(self) -> KernelArg;
}

impl DeviceScalar for f32 {
    const DATA_TYPE: DataType = DataType::Float;

    fn into_arg(self) -> KernelArg {
        KernelArg::Float(self)
    }
}

impl DeviceScalar for f16 {
    const DATA_TYPE: DataType = DataType::Half;

    fn into_arg(self) -> KernelArg {
        KernelArg::Half(self)
    }
}

impl DeviceScalar for bf16 {
    const DATA_TYPE: DataType = DataType::BFloat16;

    fn into_arg(self) -> KernelArg {
        KernelArg::BFloat16(self)
    }
}
