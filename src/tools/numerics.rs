//! NaN/Inf detection on device tensors
//!
//! Dispatch runs the configured checker over its inputs before launching and
//! over the destination afterwards when `check_numerics` is enabled.

use std::fmt;

use half::{bf16, f16};
use log::warn;
use ndarray::{ArrayViewD, IxDyn, ShapeBuilder};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::tensor::{DataType, TensorArg};

/// Reports non-finite values in a tensor
pub trait NumericsChecker: Send + fmt::Debug {
    /// `Err(Error::Numerics)` when the tensor holds a NaN or an infinity
    fn check(&self, device: &dyn Device, tensor: TensorArg<'_>) -> Result<()>;
}

/// Copies the tensor to the host and scans its logical elements
#[derive(Debug, Default, Clone, Copy)]
pub struct HostNumericsChecker;

fn decode(data_type: DataType, bytes: &[u8], count: usize) -> Option<Vec<f32>> {
    let values = match data_type {
        DataType::Float => bytes
            .chunks_exact(4)
            .take(count)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect::<Vec<_>>(),
        DataType::Half => bytes
            .chunks_exact(2)
            .take(count)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        DataType::BFloat16 => bytes
            .chunks_exact(2)
            .take(count)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        DataType::Int8 => return None,
    };
    Some(values)
}

impl NumericsChecker for HostNumericsChecker {
    fn check(&self, device: &dyn Device, tensor: TensorArg<'_>) -> Result<()> {
        let desc = tensor.desc;
        let span = desc.element_space();
        let bytes = device.read_buffer(tensor.buffer)?;
        let values = match decode(desc.data_type(), &bytes, span) {
            Some(values) => values,
            None => return Ok(()),
        };
        if values.len() < span {
            return Err(Error::Numerics(format!(
                "Buffer of {} bytes is too small for {}",
                bytes.len(),
                desc
            )));
        }

        let shape = IxDyn(desc.lengths()).strides(IxDyn(desc.strides()));
        let view = ArrayViewD::from_shape(shape, &values)
            .map_err(|e| Error::Numerics(format!("Cannot view {}: {}", desc, e)))?;

        let nan = view.iter().filter(|v| v.is_nan()).count();
        let inf = view.iter().filter(|v| v.is_infinite()).count();
        if nan + inf > 0 {
            warn!("{} holds {} NaN and {} Inf values", desc, nan, inf);
            return Err(Error::Numerics(format!(
                "{} holds {} NaN and {} Inf values",
                desc, nan, inf
            )));
        }
        Ok(())
    }
}
