pub mod cache;
pub mod context;

pub use cache::{DirectionCache, FindCache};
pub use context::{ContextOptions, ConvolutionContext};
