use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::conv::predicates::WinogradPolicy;
use crate::conv::workspace::CapacityPolicy;
use crate::device::{Device, DeviceInfo};
use crate::error::Result;
use crate::execution::cache::FindCache;
use crate::solver::Backends;
use crate::tools::numerics::{HostNumericsChecker, NumericsChecker};
use crate::tensor::DataType;

/// Options for a convolution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Allow the direct strategy
    pub direct_enabled: bool,
    /// Allow precompiled kernels (the Winograd strategy)
    pub precompiled_kernels_enabled: bool,
    /// Scan tensors for NaN/Inf around every dispatch
    pub check_numerics: bool,
    /// When GEMM workspace is dropped to zero on memory-constrained devices
    pub capacity: CapacityPolicy,
    /// Devices the Winograd strategy runs on
    pub winograd: WinogradPolicy,
    /// Tuning budget in seconds for regular GEMM kernels
    pub gemm_time_limit: f64,
    /// Tuning budget in seconds for whole-batch (CNHW) GEMM kernels
    pub gemm_transpose_time_limit: f64,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            direct_enabled: true,
            precompiled_kernels_enabled: true,
            check_numerics: false,
            capacity: CapacityPolicy::default(),
            winograd: WinogradPolicy::default(),
            gemm_time_limit: 0.003,
            gemm_transpose_time_limit: 0.03,
        }
    }
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the direct strategy
    pub fn enable_direct(mut self, enable: bool) -> Self {
        self.direct_enabled = enable;
        self
    }

    /// Enable or disable precompiled kernels
    pub fn enable_precompiled_kernels(mut self, enable: bool) -> Self {
        self.precompiled_kernels_enabled = enable;
        self
    }

    /// Enable or disable numerics checks on dispatch
    pub fn enable_check_numerics(mut self, enable: bool) -> Self {
        self.check_numerics = enable;
        self
    }

    pub fn set_capacity_policy(mut self, capacity: CapacityPolicy) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn set_winograd_policy(mut self, winograd: WinogradPolicy) -> Self {
        self.winograd = winograd;
        self
    }

    /// Set the GEMM tuning budgets in seconds
    pub fn set_gemm_time_limits(mut self, regular: f64, transpose: f64) -> Self {
        self.gemm_time_limit = regular;
        self.gemm_transpose_time_limit = transpose;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }
}

/// A device queue with the strategies bound to it and its find cache
///
/// Search and dispatch for all three directions are methods on the context.
/// The context is single-threaded: it owns its cache without locking, so
/// concurrent use needs one context per thread or external synchronization.
#[derive(Debug)]
pub struct ConvolutionContext<D: Device> {
    pub(crate) device: D,
    pub(crate) backends: Backends,
    pub(crate) options: ContextOptions,
    pub(crate) numerics: Box<dyn NumericsChecker>,
    pub(crate) cache: FindCache,
}

impl<D: Device> ConvolutionContext<D> {
    pub fn new(device: D, backends: Backends) -> Self {
        Self::with_options(device, backends, ContextOptions::default())
    }

    pub fn with_options(device: D, backends: Backends, options: ContextOptions) -> Self {
        let info = device.info();
        debug!(
            "Convolution context on {} ({} compute units)",
            info.name, info.compute_units
        );
        Self {
            device,
            backends,
            options,
            numerics: Box::new(HostNumericsChecker),
            cache: FindCache::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.device.info()
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    /// Replace the checker used when `check_numerics` is enabled
    pub fn set_numerics_checker(&mut self, checker: impl NumericsChecker + 'static) {
        self.numerics = Box::new(checker);
    }

    pub fn find_cache(&self) -> &FindCache {
        &self.cache
    }

    pub fn save_find_cache(&self, path: impl AsRef<Path>) -> Result<()> {
        self.cache.save(path)
    }

    /// Merge a saved cache in; entries already present are kept
    pub fn load_find_cache(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        self.cache.load(path)
    }

    /// GEMM strategies run only with a backend bound and on 32-bit floats
    pub(crate) fn gemm_available(&self, data_type: DataType) -> bool {
        self.backends.gemm.is_some() && data_type == DataType::Float
    }
}
