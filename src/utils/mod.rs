//! Utility functions and helpers

pub mod normalize;
pub mod numerics;

pub use normalize::{NormalizerStats, StreamingNormalizer, DEFAULT_VARIANCE_EPSILON};
pub use numerics::check_numerics;
