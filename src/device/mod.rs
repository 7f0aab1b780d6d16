//! # Device abstraction
//!
//! The convolution engine talks to an accelerator through the [`Device`] trait:
//! a single command queue with a kernel-program cache keyed by
//! `(algorithm name, network configuration)`, scratch allocation, and
//! per-launch timing. Kernel bodies live entirely behind this trait.
//!
//! [`ProfilingScope`] enables timing for the duration of a search and puts the
//! previous profiling state back when it is dropped, on every exit path.

pub mod sim;

use std::fmt;
use std::ops::{Deref, DerefMut};

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::{BufferId, DeviceBuffer};

/// Read-only snapshot of the bound device's capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name, e.g. "gfx906"
    pub name: String,
    /// Number of compute units
    pub compute_units: usize,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, compute_units: usize) -> Self {
        Self {
            name: name.into(),
            compute_units,
        }
    }
}

/// Geometry a solver compiles into a kernel, replacing positional tuples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompiledInParams {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub out_channels: usize,
    pub groups: usize,
    /// Present for Winograd kernels that take filter and output extents
    pub extent: Option<WinogradExtent>,
}

/// Extra geometry consumed by RxS Winograd kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WinogradExtent {
    pub out_height: usize,
    pub out_width: usize,
    pub filter_height: usize,
    pub filter_width: usize,
    pub pad_h: usize,
    pub pad_w: usize,
}

/// Argument layout a compiled kernel expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelAbi {
    /// `(input, weights, output, padding_value)`
    Ocl,
    /// Compiled-in geometry first, then buffers and a return address
    Asm(CompiledInParams),
    /// `(input, workspace)`
    SubSample,
    /// `(workspace, output)`
    Reduction,
    /// Three buffer operands with element offsets
    Gemm,
    /// Layout transform or fill helper with its own argument list
    Utility,
}

/// Everything needed to compile one kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub name: String,
    pub file: String,
    pub compile_options: String,
    pub local_size: Vec<usize>,
    pub global_size: Vec<usize>,
    pub abi: KernelAbi,
}

impl KernelInfo {
    pub fn new(name: impl Into<String>, file: impl Into<String>, abi: KernelAbi) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            compile_options: String::new(),
            local_size: vec![1, 1, 1],
            global_size: vec![1, 1, 1],
            abi,
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.compile_options = options.into();
        self
    }

    pub fn with_geometry(mut self, local_size: Vec<usize>, global_size: Vec<usize>) -> Self {
        self.local_size = local_size;
        self.global_size = global_size;
        self
    }
}

/// Handle to a compiled kernel held by a device's program cache
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    id: u64,
    name: String,
    abi: KernelAbi,
}

impl Kernel {
    /// Called by `Device` implementations when a program is built
    pub fn new(id: u64, name: impl Into<String>, abi: KernelAbi) -> Self {
        Self {
            id,
            name: name.into(),
            abi,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abi(&self) -> KernelAbi {
        self.abi
    }
}

/// A single kernel launch argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer { id: BufferId, offset: usize },
    Int(i32),
    Float(f32),
    Half(f16),
    BFloat16(bf16),
    Null,
}

impl KernelArg {
    /// Integer argument from an extent; device ABIs take 32-bit ints
    pub fn int(value: usize) -> Self {
        KernelArg::Int(value as i32)
    }
}

/// The accelerator queue the convolution engine runs on
///
/// Contexts are single-queue and single-threaded; share one across threads
/// only behind external synchronization.
pub trait Device: Send + fmt::Debug {
    /// Name and compute-unit count of the bound device
    fn info(&self) -> DeviceInfo;

    /// Compile a kernel, or fetch it if `(algorithm, network_config)` already
    /// holds one at `cache_index`
    fn add_kernel(
        &mut self,
        algorithm: &str,
        network_config: &str,
        info: &KernelInfo,
        cache_index: usize,
    ) -> Result<Kernel>;

    /// Drop slots at `len` and beyond under `(algorithm, network_config)`
    fn truncate_kernels(&mut self, algorithm: &str, network_config: &str, len: usize);

    /// All kernels previously compiled under `(algorithm, network_config)`, in cache order
    fn kernels(&self, algorithm: &str, network_config: &str) -> Vec<Kernel>;

    /// The first kernel compiled under `(algorithm, network_config)`
    fn kernel(&self, algorithm: &str, network_config: &str) -> Result<Kernel> {
        self.kernels(algorithm, network_config)
            .into_iter()
            .next()
            .ok_or_else(|| Error::MissingKernel {
                algorithm: algorithm.to_string(),
                network_config: network_config.to_string(),
            })
    }

    /// Allocate `bytes` of device memory
    fn allocate(&mut self, bytes: usize) -> Result<DeviceBuffer>;

    /// Return a buffer to the device
    fn release(&mut self, buffer: DeviceBuffer);

    /// Copy a buffer's bytes back to the host
    fn read_buffer(&self, buffer: &DeviceBuffer) -> Result<Vec<u8>>;

    /// Enqueue a kernel and wait for it
    fn launch(&mut self, kernel: &Kernel, args: &[KernelArg]) -> Result<()>;

    /// Elapsed time of the last launch in milliseconds, plus anything accumulated since
    fn kernel_time(&self) -> f32;

    /// Add `ms` to the reported kernel time
    fn accum_kernel_time(&mut self, ms: f32);

    fn reset_kernel_time(&mut self);

    fn is_profiling_enabled(&self) -> bool;

    fn enable_profiling(&mut self, enable: bool);
}

/// Enables device timing while alive and restores the prior state on drop
pub struct ProfilingScope<'a> {
    device: &'a mut dyn Device,
    previous: bool,
}

impl<'a> ProfilingScope<'a> {
    pub fn new(device: &'a mut dyn Device) -> Self {
        let previous = device.is_profiling_enabled();
        device.enable_profiling(true);
        Self { device, previous }
    }
}

impl<'a> Deref for ProfilingScope<'a> {
    type Target = dyn Device + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.device
    }
}

impl<'a> DerefMut for ProfilingScope<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.device
    }
}

impl Drop for ProfilingScope<'_> {
    fn drop(&mut self) {
        self.device.enable_profiling(self.previous);
        self.device.reset_kernel_time();
    }
}

/// Sums kernel times across a multi-launch dispatch and reports the total
/// as one duration
pub(crate) struct KernelTimer {
    profiling: bool,
    total: f32,
}

impl KernelTimer {
    pub(crate) fn start(device: &dyn Device) -> Self {
        Self {
            profiling: device.is_profiling_enabled(),
            total: 0.0,
        }
    }

    /// Record the time of the launch that just completed
    pub(crate) fn lap(&mut self, device: &dyn Device) {
        if self.profiling {
            self.total += device.kernel_time();
        }
    }

    pub(crate) fn finish(self, device: &mut dyn Device) {
        if self.profiling {
            device.reset_kernel_time();
            device.accum_kernel_time(self.total);
        }
    }
}
