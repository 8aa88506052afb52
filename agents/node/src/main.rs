//! The oracle node follows the chain head, runs the pipelines of its jobs
//! when their triggers fire and submits the resulting transactions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use eyre::Result;

use oracle_base::agent_main;

use crate::node::OracleNode;

mod node;
mod server;
mod settings;

#[cfg(test)]
mod test_utils;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    // Logging is not initialised at this point, so, using `println!`
    println!("Oracle node starting up...");

    agent_main::<OracleNode>().await
}
