//! Convolution problem description, planning, search and dispatch

pub mod algorithm;
pub mod bias;
pub mod dispatch;
pub mod fingerprint;
pub mod gemm;
pub(crate) mod invoke;
pub mod params;
pub mod predicates;
pub mod search;
pub mod shape;
pub(crate) mod transforms;
pub mod workspace;

pub use algorithm::{
    AlgorithmCandidate, ConvAlgorithm, ConvBwdDataAlgorithm, ConvBwdWeightsAlgorithm,
    ConvFwdAlgorithm, PerfResult, StrategyFamily,
};
pub use fingerprint::ConfigFingerprint;
pub use gemm::{GemmGeometry, GemmLayout, GemmPath};
pub use params::{ConvMode, ConvParams, PaddingMode};
pub use predicates::{WinogradFamily, WinogradPolicy};
pub use search::FindOptions;
pub use workspace::CapacityPolicy;
