//! Jobs: TOML specs naming a trigger and a pipeline. The spawner stores
//! jobs and hands them to the delegate of their type, whose services start
//! pipeline runs when the trigger fires.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used, clippy::panic)]

pub use config::JobsConfig;
pub use cron::{CronDelegate, CronSchedule};
pub use delegate::{Delegate, Service};
pub use direct_request::{
    oracle_request_topic, spec_id_topic, DirectRequestDelegate, OracleRequest,
    ABANDONED_AFTER_REORG, ORACLE_REQUEST_SIGNATURE, REORGED,
};
pub use error::*;
pub use metrics::JobMetrics;
pub use spawner::{CreatedJob, Spawner};
pub use spec::*;
pub use store::{ConsumedLog, JobStore};
pub use webhook::WebhookDelegate;

mod config;
mod cron;
mod delegate;
mod direct_request;
mod error;
mod metrics;
mod spawner;
mod spec;
mod store;
mod webhook;
