//! Follows the canonical chain tip, persists recent heads and fans every new
//! longest chain out to the components that track heads.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used, clippy::panic)]

pub use broadcaster::*;
pub use error::*;
pub use metrics::HeadTrackerMetrics;
pub use store::*;
pub use tracker::*;

mod broadcaster;
mod error;
mod metrics;
mod store;
mod tracker;
