use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use derive_new::new;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use oracle_base::auth::verify_token;
use pipeline::{PipelineRun, PipelineRunner};

use crate::{
    Delegate, JobError, JobKind, JobMetrics, JobResult, JobSpec, JobStore, JobType, Service,
};

/// Runs webhook jobs. They have no services; runs start when an authorised
/// caller posts to the job, unless the job is being deleted.
#[derive(Debug, new)]
pub struct WebhookDelegate {
    runner: PipelineRunner,
    store: Arc<dyn JobStore>,
    metrics: JobMetrics,
    #[new(default)]
    draining: Mutex<HashSet<i64>>,
}

impl WebhookDelegate {
    /// Starts a run of the webhook job `external_job_id` for a caller
    /// presenting `token`.
    #[instrument(skip(self, token, body, meta))]
    pub async fn run_webhook_job(
        &self,
        external_job_id: Uuid,
        token: Option<&str>,
        body: String,
        meta: Value,
    ) -> JobResult<PipelineRun> {
        let job = self
            .store
            .job_by_external_id(external_job_id)
            .await?
            .filter(|j| matches!(j.kind, JobKind::Webhook))
            .ok_or_else(|| JobError::NotFound(format!("webhook job {external_job_id}")))?;

        let authorised = match (token, job.webhook_token_hash.as_deref()) {
            (Some(token), Some(hash)) => verify_token(token, hash),
            _ => false,
        };
        if !authorised {
            warn!(job_id = job.id, "Rejected webhook call");
            return Err(JobError::Unauthorized);
        }
        if self.draining.lock().contains(&job.id) {
            info!(job_id = job.id, "Rejected webhook call for a job being deleted");
            return Err(JobError::Draining(format!("webhook job {external_job_id}")));
        }

        let vars = job.run_vars(json!({ "requestBody": body, "meta": meta }));
        let run = self
            .runner
            .start_run(job.pipeline_spec_id, Some(job.id), vars)
            .await?;
        self.metrics
            .runs_triggered
            .with_label_values(&[JobType::Webhook.as_ref()])
            .inc();
        info!(job_id = job.id, run_id = run.id, "Started webhook run");
        Ok(run)
    }
}

#[async_trait]
impl Delegate for WebhookDelegate {
    fn job_type(&self) -> JobType {
        JobType::Webhook
    }

    async fn before_job_deleted(&self, job: &JobSpec) {
        self.draining.lock().insert(job.id);
    }

    async fn after_job_deleted(&self, job: &JobSpec) {
        self.draining.lock().remove(&job.id);
    }

    async fn job_deletion_aborted(&self, job: &JobSpec) {
        self.draining.lock().remove(&job.id);
    }

    async fn services_for_spec(&self, _job: &JobSpec) -> JobResult<Vec<Arc<dyn Service>>> {
        Ok(Vec::new())
    }
}
