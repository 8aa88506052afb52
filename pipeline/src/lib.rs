//! Pipelines: DAGs of tasks described in a DOT-like language, executed
//! durably. Every task of a run executes at most once; a task that waits on
//! an external result suspends the run until it is resumed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used, clippy::panic)]

pub use bridges::*;
pub use config::RunnerConfig;
pub use dag::{Pipeline, TaskSpec};
pub use error::*;
pub use metrics::PipelineMetrics;
pub use runner::*;
pub use store::*;
pub use tasks::{
    run_task, EthTxRequest, TaskContext, TaskEnv, TaskError, TaskInput, TaskOutcome, TaskType,
    TxSubmitter, VrfProver, VrfRequest,
};
pub use types::*;
pub use vars::Vars;

mod bridges;
mod config;
/// Pipeline source parsing
pub mod dag;
mod error;
mod metrics;
mod runner;
mod store;
/// Built-in tasks
pub mod tasks;
mod types;
mod vars;

#[cfg(test)]
mod tests;
