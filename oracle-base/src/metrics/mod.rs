pub use self::core::*;

mod core;

/// Recommended default histogram buckets for network communication.
pub const NETWORK_HISTOGRAM_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10.];

const NAMESPACE: &str = "oracle";
