// tools module

pub mod numerics;

pub use numerics::{HostNumericsChecker, NumericsChecker};
