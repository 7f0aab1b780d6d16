//! Simulated accelerator queue
//!
//! `SimDevice` keeps buffers in host memory, "compiles" kernels into an
//! in-memory program cache and charges a fixed, configurable cost per launch.
//! Kernel bodies are not executed; the launch log records what would have run.

use std::collections::{HashMap, HashSet};

use crate::device::{Device, DeviceInfo, Kernel, KernelArg, KernelInfo};
use crate::error::{Error, Result};
use crate::tensor::{BufferId, DeviceBuffer};

/// Cost charged to kernels without an explicit entry
pub const DEFAULT_KERNEL_COST_MS: f32 = 1.0;

/// One recorded launch
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub kernel: String,
    pub args: Vec<KernelArg>,
}

#[derive(Debug)]
pub struct SimDevice {
    info: DeviceInfo,
    programs: HashMap<(String, String), Vec<Option<Kernel>>>,
    next_kernel_id: u64,
    buffers: HashMap<BufferId, Vec<u8>>,
    next_buffer_id: u64,
    profiling: bool,
    kernel_time: f32,
    kernel_costs: HashMap<String, f32>,
    default_cost: f32,
    compile_failures: HashSet<String>,
    launch_failures: HashSet<String>,
    launches: Vec<LaunchRecord>,
    compilations: usize,
}

impl SimDevice {
    pub fn new(name: &str, compute_units: usize) -> Self {
        Self {
            info: DeviceInfo::new(name, compute_units),
            programs: HashMap::new(),
            next_kernel_id: 1,
            buffers: HashMap::new(),
            next_buffer_id: 1,
            profiling: false,
            kernel_time: 0.0,
            kernel_costs: HashMap::new(),
            default_cost: DEFAULT_KERNEL_COST_MS,
            compile_failures: HashSet::new(),
            launch_failures: HashSet::new(),
            launches: Vec::new(),
            compilations: 0,
        }
    }

    /// Charge `ms` for every launch of kernels named `kernel`
    pub fn set_kernel_cost(&mut self, kernel: &str, ms: f32) {
        self.kernel_costs.insert(kernel.to_string(), ms);
    }

    pub fn set_default_cost(&mut self, ms: f32) {
        self.default_cost = ms;
    }

    /// Make building kernels named `kernel` fail
    pub fn fail_compilation_of(&mut self, kernel: &str) {
        self.compile_failures.insert(kernel.to_string());
    }

    /// Make launching kernels named `kernel` fail
    pub fn fail_launch_of(&mut self, kernel: &str) {
        self.launch_failures.insert(kernel.to_string());
    }

    /// Overwrite a buffer's contents from the host
    pub fn write_buffer(&mut self, buffer: &DeviceBuffer, bytes: &[u8]) -> Result<()> {
        let data = self
            .buffers
            .get_mut(&buffer.id())
            .ok_or_else(|| Error::Device(format!("Unknown buffer {:?}", buffer.id())))?;
        if bytes.len() > data.len() {
            return Err(Error::Device(format!(
                "Write of {} bytes overflows buffer of {} bytes",
                bytes.len(),
                data.len()
            )));
        }
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn launches(&self) -> &[LaunchRecord] {
        &self.launches
    }

    pub fn launch_count(&self) -> usize {
        self.launches.len()
    }

    /// Names of launched kernels, in launch order
    pub fn launched_kernels(&self) -> Vec<&str> {
        self.launches.iter().map(|l| l.kernel.as_str()).collect()
    }

    pub fn clear_launches(&mut self) {
        self.launches.clear();
    }

    /// Number of kernel builds performed (cache fetches excluded)
    pub fn compilation_count(&self) -> usize {
        self.compilations
    }

    /// Number of buffers currently allocated
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn cost_of(&self, kernel: &str) -> f32 {
        self.kernel_costs
            .get(kernel)
            .copied()
            .unwrap_or(self.default_cost)
    }
}

impl Device for SimDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn add_kernel(
        &mut self,
        algorithm: &str,
        network_config: &str,
        info: &KernelInfo,
        cache_index: usize,
    ) -> Result<Kernel> {
        let key = (algorithm.to_string(), network_config.to_string());
        if let Some(Some(existing)) = self
            .programs
            .get(&key)
            .and_then(|slots| slots.get(cache_index))
        {
            if existing.name() == info.name && existing.abi() == info.abi {
                return Ok(existing.clone());
            }
        }

        if self.compile_failures.contains(&info.name) {
            return Err(Error::Build(format!(
                "{} from {} with options '{}'",
                info.name, info.file, info.compile_options
            )));
        }

        let kernel = Kernel::new(self.next_kernel_id, info.name.clone(), info.abi);
        self.next_kernel_id += 1;
        self.compilations += 1;

        let slots = self.programs.entry(key).or_default();
        if slots.len() <= cache_index {
            slots.resize(cache_index + 1, None);
        }
        slots[cache_index] = Some(kernel.clone());
        Ok(kernel)
    }

    fn truncate_kernels(&mut self, algorithm: &str, network_config: &str, len: usize) {
        let key = (algorithm.to_string(), network_config.to_string());
        if let Some(slots) = self.programs.get_mut(&key) {
            slots.truncate(len);
        }
    }

    fn kernels(&self, algorithm: &str, network_config: &str) -> Vec<Kernel> {
        self.programs
            .get(&(algorithm.to_string(), network_config.to_string()))
            .map(|slots| slots.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    fn allocate(&mut self, bytes: usize) -> Result<DeviceBuffer> {
        let id = BufferId(self.next_buffer_id);
        self.next_buffer_id += 1;
        self.buffers.insert(id, vec![0; bytes]);
        Ok(DeviceBuffer::new(id, bytes))
    }

    fn release(&mut self, buffer: DeviceBuffer) {
        self.buffers.remove(&buffer.id());
    }

    fn read_buffer(&self, buffer: &DeviceBuffer) -> Result<Vec<u8>> {
        self.buffers
            .get(&buffer.id())
            .cloned()
            .ok_or_else(|| Error::Device(format!("Unknown buffer {:?}", buffer.id())))
    }

    fn launch(&mut self, kernel: &Kernel, args: &[KernelArg]) -> Result<()> {
        for arg in args {
            if let KernelArg::Buffer { id, .. } = arg {
                if !self.buffers.contains_key(id) {
                    return Err(Error::Device(format!(
                        "Kernel {} launched with unknown buffer {:?}",
                        kernel.name(),
                        id
                    )));
                }
            }
        }
        if self.launch_failures.contains(kernel.name()) {
            return Err(Error::Device(format!("Kernel {} failed", kernel.name())));
        }

        if self.profiling {
            self.kernel_time = self.cost_of(kernel.name());
        }
        self.launches.push(LaunchRecord {
            kernel: kernel.name().to_string(),
            args: args.to_vec(),
        });
        Ok(())
    }

    fn kernel_time(&self) -> f32 {
        self.kernel_time
    }

    fn accum_kernel_time(&mut self, ms: f32) {
        self.kernel_time += ms;
    }

    fn reset_kernel_time(&mut self) {
        self.kernel_time = 0.0;
    }

    fn is_profiling_enabled(&self) -> bool {
        self.profiling
    }

    fn enable_profiling(&mut self, enable: bool) {
        self.profiling = enable;
    }
}
