use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use auto_impl::auto_impl;

use crate::{JobResult, JobSpec, JobType};

/// A long running part of a job, such as a schedule or a log listener.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait Service: Send + Sync + Debug {
    /// Starts the service. Must return promptly; work happens in spawned
    /// tasks.
    async fn start(&self) -> JobResult<()>;

    /// Stops the service. No new runs are triggered once this returns.
    async fn close(&self);
}

/// Knows how to run jobs of one type.
///
/// The spawner calls the hooks around the lifetime of every job of the
/// delegate's type and owns the services the delegate hands out.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait Delegate: Send + Sync + Debug {
    /// Type of the jobs this delegate runs
    fn job_type(&self) -> JobType;

    /// Called once before any job is loaded.
    async fn start(&self) -> JobResult<()> {
        Ok(())
    }

    /// Called once when the node shuts down, after every service closed.
    async fn close(&self) {}

    /// Called after a job was stored, before its services start.
    async fn after_job_created(&self, _job: &JobSpec) {}

    /// Called before the services of a job being deleted are closed. No
    /// new runs of the job may start from here on.
    async fn before_job_deleted(&self, _job: &JobSpec) {}

    /// Called once the job is tombstoned.
    async fn after_job_deleted(&self, _job: &JobSpec) {}

    /// Called when a deletion gave up and the job's services run again.
    async fn job_deletion_aborted(&self, _job: &JobSpec) {}

    /// The services making up a running job.
    async fn services_for_spec(&self, job: &JobSpec) -> JobResult<Vec<Arc<dyn Service>>>;

    /// Looks for triggers again starting at block `number`.
    async fn replay_from_block(&self, _number: u64) -> JobResult<()> {
        Ok(())
    }
}
