use std::{collections::HashMap, sync::Arc, time::Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use oracle_base::auth::{hash_token, new_token};
use pipeline::PipelineRunner;

use crate::{
    Delegate, JobError, JobKind, JobMetrics, JobResult, JobSpec, JobStore, JobType, JobsConfig,
    NewJob, Service,
};

/// A job just created. The webhook token is only ever shown here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedJob {
    /// The stored job
    pub job: JobSpec,
    /// Token authorising webhook runs, for webhook jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_token: Option<String>,
}

/// Owns the lifecycle of jobs: stores them, starts the services their
/// delegate hands out, and stops them again on deletion or shutdown.
#[derive(Debug, Clone)]
pub struct Spawner {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn JobStore>,
    runner: PipelineRunner,
    delegates: HashMap<JobType, Arc<dyn Delegate>>,
    active: Mutex<HashMap<i64, Vec<Arc<dyn Service>>>>,
    config: JobsConfig,
    metrics: JobMetrics,
}

impl Spawner {
    /// A spawner dispatching to `delegates` by their job type.
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: PipelineRunner,
        delegates: Vec<Arc<dyn Delegate>>,
        config: JobsConfig,
        metrics: JobMetrics,
    ) -> Self {
        let delegates = delegates.into_iter().map(|d| (d.job_type(), d)).collect();
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                delegates,
                active: Default::default(),
                config,
                metrics,
            }),
        }
    }

    fn delegate(&self, job_type: JobType) -> JobResult<&Arc<dyn Delegate>> {
        self.inner
            .delegates
            .get(&job_type)
            .ok_or_else(|| JobError::validation(format!("no delegate for {job_type} jobs")))
    }

    /// Starts the delegates and the services of every stored job, then the
    /// background resumer. Returns the resumer task.
    #[instrument(skip_all)]
    pub async fn start(&self, cancel: CancellationToken) -> JobResult<JoinHandle<()>> {
        for delegate in self.inner.delegates.values() {
            delegate.start().await?;
        }
        let jobs = self.inner.store.jobs().await?;
        let count = jobs.len();
        for job in jobs {
            // a broken job must not keep the others from starting
            if let Err(error) = self.start_services(&job).await {
                error!(job_id = job.id, %error, "Failed to start job");
            }
        }
        info!(jobs = count, "Started stored jobs");

        let spawner = self.clone();
        Ok(tokio::spawn(
            async move { spawner.resume_missed(cancel).await }.instrument(info_span!("Resumer")),
        ))
    }

    async fn resume_missed(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.trigger_fallback_db_poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(error) = self.inner.runner.recover().await {
                warn!(%error, "Failed to recover pipeline runs");
            }
        }
    }

    async fn start_services(&self, job: &JobSpec) -> JobResult<()> {
        let services = self
            .delegate(job.job_type())?
            .services_for_spec(job)
            .await?;
        let mut started: Vec<Arc<dyn Service>> = Vec::with_capacity(services.len());
        for service in services {
            if let Err(error) = service.start().await {
                for s in started {
                    s.close().await;
                }
                return Err(error);
            }
            started.push(service);
        }
        debug!(job_id = job.id, services = started.len(), "Job services started");
        self.inner.active.lock().await.insert(job.id, started);
        self.inner.metrics.active_jobs.inc();
        Ok(())
    }

    /// Validates, stores and starts the job described by `toml`.
    #[instrument(skip_all)]
    pub async fn create_job(&self, toml: &str) -> JobResult<CreatedJob> {
        let new_job = NewJob::parse(toml)?;
        let delegate = self.delegate(new_job.kind.job_type())?.clone();

        let webhook_token = matches!(new_job.kind, JobKind::Webhook).then(new_token);
        let job = self
            .inner
            .store
            .insert_job(&new_job, webhook_token.as_deref().map(hash_token))
            .await?
            .ok_or_else(|| {
                JobError::validation(format!(
                    "a job with external id {} already exists",
                    new_job.external_job_id
                ))
            })?;
        info!(job_id = job.id, job_type = %job.job_type(), "Created job");

        delegate.after_job_created(&job).await;
        if let Err(error) = self.start_services(&job).await {
            // a job that cannot start is not kept, so it can be created again
            match self.inner.store.remove_job(job.id).await {
                Ok(_) => warn!(job_id = job.id, %error, "Job failed to start, removed it"),
                Err(db_error) => {
                    error!(job_id = job.id, %error, %db_error, "Failed to remove job that did not start")
                }
            }
            return Err(error);
        }
        Ok(CreatedJob { job, webhook_token })
    }

    /// Stops the job, waits for its running runs and marks it deleted.
    ///
    /// A job whose runs are still executing after the drain timeout is not
    /// deleted: its services start again and [`JobError::Draining`] is
    /// returned.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, id: i64) -> JobResult<()> {
        let job = self.get_job(id).await?;
        let delegate = self.delegate(job.job_type()).ok().cloned();
        if let Some(delegate) = &delegate {
            delegate.before_job_deleted(&job).await;
        }
        self.stop_services(id).await;
        debug!("Draining job");

        if let Err(error) = self.drain_and_tombstone(id).await {
            warn!(%error, "Job not deleted, restarting it");
            if let Err(error) = self.start_services(&job).await {
                error!(%error, "Failed to restart job");
            }
            if let Some(delegate) = &delegate {
                delegate.job_deletion_aborted(&job).await;
            }
            return Err(error);
        }
        if let Some(delegate) = &delegate {
            delegate.after_job_deleted(&job).await;
        }
        info!("Deleted job");
        Ok(())
    }

    async fn drain_and_tombstone(&self, id: i64) -> JobResult<()> {
        let timeout = self.inner.config.drain_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let running = self.inner.runner.count_running_runs(id).await?;
            if running == 0 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(JobError::Draining(format!(
                    "job {id} still has {running} runs executing after {timeout:?}"
                )));
            }
            debug!(running, "Waiting for runs to drain");
            tokio::time::sleep(DRAIN_POLL).await;
        }
        self.inner.store.tombstone_job(id).await?;
        Ok(())
    }

    async fn stop_services(&self, id: i64) {
        let services = self.inner.active.lock().await.remove(&id);
        if let Some(services) = services {
            join_all(services.iter().map(|s| s.close())).await;
            self.inner.metrics.active_jobs.dec();
        }
    }

    /// Every job not deleted.
    pub async fn list_jobs(&self) -> JobResult<Vec<JobSpec>> {
        Ok(self.inner.store.jobs().await?)
    }

    /// A job not deleted.
    pub async fn get_job(&self, id: i64) -> JobResult<JobSpec> {
        self.inner
            .store
            .job(id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("job {id}")))
    }

    /// Has every delegate look for triggers again from block `number`.
    #[instrument(skip(self))]
    pub async fn replay_from_block(&self, number: u64) -> JobResult<()> {
        for delegate in self.inner.delegates.values() {
            delegate.replay_from_block(number).await?;
        }
        Ok(())
    }

    /// Stops every running job, then the delegates.
    pub async fn close(&self) {
        let active: Vec<_> = self.inner.active.lock().await.drain().collect();
        let jobs = active.len();
        join_all(
            active
                .iter()
                .flat_map(|(_, services)| services.iter().map(|s| s.close())),
        )
        .await;
        self.inner.metrics.active_jobs.set(0);
        join_all(self.inner.delegates.values().map(|d| d.close())).await;
        info!(jobs, "Job spawner closed");
    }
}

const DRAIN_POLL: std::time::Duration = std::time::Duration::from_millis(100);
