//! This crate contains the domain types, chain facing traits and small
//! utilities shared by every component of the oracle node.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used, clippy::panic)]

pub use ethers_core::types::{Address, Bytes, H256, U256};

pub use error::*;
pub use traits::*;
pub use types::*;

mod error;
/// Traits for the external collaborators the core consumes
pub mod traits;
/// Core data types
pub mod types;
/// Utilities shared across crates
pub mod utils;
