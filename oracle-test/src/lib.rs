//! This crate contains mocks and a scriptable simulated chain for testing
//! the oracle node.

#![forbid(unsafe_code)]
#![cfg_attr(test, warn(missing_docs))]

/// Mocks of the chain facing traits
pub mod mocks;

/// In-memory chain driven by tests
pub mod simulated;

pub use simulated::{test_key_store, SentTx, SimulatedChain};
