//! The transaction manager: a durable outbox for outbound transactions.
//!
//! Every enqueued transaction gets a nonce, is signed and broadcast by the
//! broadcaster of its sending address, has its gas price bumped while it
//! stalls and is confirmed against new heads until it is final. State lives
//! in the database so all of this survives restarts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used, clippy::panic)]

pub use balance::BalanceMonitor;
pub use config::*;
pub use error::*;
pub use gas::*;
pub use manager::*;
pub use metrics::TxmMetrics;
pub use send::*;
pub use store::*;
pub use types::*;

mod balance;
mod broadcaster;
mod config;
mod confirmer;
mod error;
mod gas;
mod manager;
mod metrics;
mod send;
mod store;
mod types;

#[cfg(test)]
mod tests;
