//! This crate contains the shared runtime of the oracle node: settings,
//! tracing, metrics, the HTTP server base, the database handle and the
//! ethers backed chain client and key store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used, clippy::panic)]

pub mod settings;

pub mod auth;

mod agent;
pub use agent::*;

/// Ethers backed chain client
pub mod chain;

/// Database handle, generated entities and conversions
pub mod db;

mod keystore;
pub use keystore::*;

/// Prometheus metrics
pub mod metrics;
pub use metrics::CoreMetrics;

/// HTTP server
pub mod server;
