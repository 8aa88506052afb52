//! Scheduled jobs.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use derive_new::new;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use pipeline::PipelineRunner;

use crate::{Delegate, JobError, JobKind, JobMetrics, JobResult, JobSpec, JobType, Service};

const TZ_PREFIX: &str = "CRON_TZ=";

/// A cron expression with seconds, evaluated in an explicit time zone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    tz: Tz,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parses `CRON_TZ=<tz> <sec> <min> <hour> <day> <month> <weekday>`.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        let rest = expr
            .strip_prefix(TZ_PREFIX)
            .ok_or_else(|| format!("schedule {expr:?} must start with {TZ_PREFIX}<timezone>"))?;
        let (tz, fields) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| format!("schedule {expr:?} has no cron fields"))?;
        let tz = Tz::from_str(tz).map_err(|e| format!("invalid {TZ_PREFIX} timezone: {e}"))?;
        let fields = fields.trim();
        let count = fields.split_whitespace().count();
        if count != 6 {
            return Err(format!(
                "schedule {expr:?} needs 6 fields including seconds, found {count}"
            ));
        }
        let schedule = cron::Schedule::from_str(fields)
            .map_err(|e| format!("invalid cron expression {fields:?}: {e}"))?;
        Ok(Self { tz, schedule })
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Starts a run of the job at every firing of its schedule. A firing does
/// not wait for runs of earlier firings.
#[derive(Debug)]
pub struct CronService {
    job: JobSpec,
    schedule: CronSchedule,
    runner: PipelineRunner,
    metrics: JobMetrics,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronService {
    fn new(
        job: JobSpec,
        schedule: CronSchedule,
        runner: PipelineRunner,
        metrics: JobMetrics,
    ) -> Self {
        Self {
            job,
            schedule,
            runner,
            metrics,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    async fn run(
        job: JobSpec,
        schedule: CronSchedule,
        runner: PipelineRunner,
        metrics: JobMetrics,
        cancel: CancellationToken,
    ) {
        loop {
            let now = Utc::now();
            let Some(next) = schedule.next_after(now) else {
                warn!("Schedule has no further firings");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            let vars = job.run_vars(json!({"meta": {}}));
            match runner
                .start_run(job.pipeline_spec_id, Some(job.id), vars)
                .await
            {
                Ok(run) => {
                    metrics
                        .runs_triggered
                        .with_label_values(&[JobType::Cron.as_ref()])
                        .inc();
                    debug!(run_id = run.id, firing = %next, "Cron fired");
                }
                Err(error) => warn!(%error, "Failed to start cron run"),
            }
        }
    }
}

#[async_trait]
impl Service for CronService {
    async fn start(&self) -> JobResult<()> {
        let task = Self::run(
            self.job.clone(),
            self.schedule.clone(),
            self.runner.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        )
        .instrument(info_span!("CronJob", job_id = self.job.id));
        *self.handle.lock() = Some(tokio::spawn(task));
        info!(job_id = self.job.id, "Cron schedule started");
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!(%error, "Cron task ended abnormally");
            }
        }
    }
}

/// Runs cron jobs.
#[derive(Debug, new)]
pub struct CronDelegate {
    runner: PipelineRunner,
    metrics: JobMetrics,
}

#[async_trait]
impl Delegate for CronDelegate {
    fn job_type(&self) -> JobType {
        JobType::Cron
    }

    async fn services_for_spec(&self, job: &JobSpec) -> JobResult<Vec<Arc<dyn Service>>> {
        let JobKind::Cron { schedule } = &job.kind else {
            return Err(JobError::validation(format!(
                "job {} is not a cron job",
                job.id
            )));
        };
        let schedule = CronSchedule::parse(schedule).map_err(JobError::Validation)?;
        Ok(vec![Arc::new(CronService::new(
            job.clone(),
            schedule,
            self.runner.clone(),
            self.metrics.clone(),
        ))])
    }
}
