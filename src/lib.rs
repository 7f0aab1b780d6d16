//! Convolution algorithm selection and execution
//!
//! A [`ConvolutionContext`] binds a [`Device`] to the strategy families that
//! can run on it. For each direction it sizes scratch memory, benchmarks the
//! applicable strategies and remembers the winner, then dispatches the chosen
//! algorithm on caller buffers.

pub mod conv;
pub mod device;
pub mod error;
pub mod execution;
pub mod solver;
pub mod tensor;
pub mod tools;

// Re-export commonly used types
pub use conv::{
    AlgorithmCandidate, CapacityPolicy, ConfigFingerprint, ConvAlgorithm, ConvBwdDataAlgorithm,
    ConvBwdWeightsAlgorithm, ConvFwdAlgorithm, ConvMode, ConvParams, FindOptions, PaddingMode,
    PerfResult, StrategyFamily, WinogradFamily, WinogradPolicy,
};
pub use device::{Device, DeviceInfo, Kernel, KernelAbi, KernelArg, KernelInfo, ProfilingScope};
pub use error::{Error, Result, Status};
pub use execution::{ContextOptions, ConvolutionContext, FindCache};
pub use solver::{Backends, ConvSolution, Direction, ProblemDescription};
pub use tensor::{DataType, DeviceBuffer, TensorArg, TensorDesc};
pub use tools::{HostNumericsChecker, NumericsChecker};
