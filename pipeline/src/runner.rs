use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use txm::{ResumeCallback, TxOutcome};

use crate::{
    dag::Pipeline,
    run_task,
    store::{NewTaskRun, RunStore},
    PipelineError, PipelineMetrics, PipelineResult, PipelineRun, PipelineSpec, RunState,
    RunWithTasks, TaskContext, TaskEnv, TaskInput, TaskOutcome, TaskRun, TaskRunState,
    TaskRunUpdate, TaskType, Vars,
};

/// Executes pipeline runs durably.
///
/// A run advances in rounds: every task whose predecessors are all terminal
/// executes concurrently, and the round's results are persisted together
/// before the next round starts. A task that returns
/// [`TaskOutcome::Pending`] suspends the run once nothing else can make
/// progress; [`PipelineRunner::resume_task`] records its result and picks up
/// where the run left off.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn RunStore>,
    env: TaskEnv,
    metrics: PipelineMetrics,
    /// Serializes advancing and resuming of a run
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl PipelineRunner {
    /// Creates a runner over `store`.
    pub fn new(store: Arc<dyn RunStore>, env: TaskEnv, metrics: PipelineMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                env,
                metrics,
                locks: Default::default(),
            }),
        }
    }

    /// Collaborators handed to tasks.
    pub fn env(&self) -> &TaskEnv {
        &self.inner.env
    }

    /// Validates and stores a pipeline source.
    pub async fn create_spec(
        &self,
        source: &str,
        max_task_duration: Option<Duration>,
    ) -> PipelineResult<PipelineSpec> {
        Pipeline::parse(source)?;
        Ok(self
            .inner
            .store
            .insert_pipeline_spec(source, max_task_duration)
            .await?)
    }

    /// Creates a run of `spec_id` with all its task runs pending.
    #[instrument(skip(self, inputs))]
    pub async fn create_run(
        &self,
        spec_id: i64,
        job_id: Option<i64>,
        inputs: Value,
    ) -> PipelineResult<PipelineRun> {
        let spec = self.spec(spec_id).await?;
        let pipeline = Pipeline::parse(&spec.source)?;
        let tasks: Vec<NewTaskRun> = pipeline
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| NewTaskRun {
                id: Uuid::new_v4(),
                dot_id: t.dot_id.clone(),
                task_type: t.task_type.to_string(),
                index: i as i32,
            })
            .collect();
        let run = self
            .inner
            .store
            .create_run(spec.id, job_id, &inputs, &tasks)
            .await?;
        self.inner.metrics.runs_started.inc();
        info!(run_id = run.id, tasks = tasks.len(), "Created pipeline run");
        Ok(run)
    }

    /// Creates a run and executes it until it finishes or suspends.
    pub async fn execute_run(
        &self,
        spec_id: i64,
        job_id: Option<i64>,
        inputs: Value,
    ) -> PipelineResult<RunWithTasks> {
        let run = self.create_run(spec_id, job_id, inputs).await?;
        self.advance(run.id).await?;
        self.get_run(run.id).await
    }

    /// Creates a run and executes it in the background.
    pub async fn start_run(
        &self,
        spec_id: i64,
        job_id: Option<i64>,
        inputs: Value,
    ) -> PipelineResult<PipelineRun> {
        let run = self.create_run(spec_id, job_id, inputs).await?;
        let runner = self.clone();
        let run_id = run.id;
        tokio::spawn(
            async move {
                if let Err(error) = runner.advance(run_id).await {
                    warn!(%error, "Pipeline run failed to advance");
                }
            }
            .instrument(info_span!("PipelineRun", run_id)),
        );
        Ok(run)
    }

    /// Executes every task that can run until the run finishes or suspends.
    pub async fn advance(&self, run_id: i64) -> PipelineResult<RunState> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        self.advance_locked(run_id).await
    }

    /// Completes the suspended task run `task_run_id` with `result` and
    /// advances its run. Fails with [`PipelineError::Validation`] when the
    /// task run is not suspended.
    #[instrument(skip(self, result))]
    pub async fn resume_task(
        &self,
        task_run_id: Uuid,
        result: TaskInput,
    ) -> PipelineResult<RunState> {
        let task_run = self
            .inner
            .store
            .task_run(task_run_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("task run {task_run_id}")))?;
        let run_id = task_run.pipeline_run_id;
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let update = match result {
            Ok(value) => TaskRunUpdate {
                id: task_run_id,
                state: TaskRunState::Completed,
                output: Some(value),
                error: None,
            },
            Err(error) => TaskRunUpdate {
                id: task_run_id,
                state: TaskRunState::Errored,
                output: None,
                error: Some(error),
            },
        };
        if !self.inner.store.resume_task_run(&update, run_id).await? {
            return Err(PipelineError::Validation(format!(
                "task run {task_run_id} is not suspended"
            )));
        }
        info!(run_id, dot_id = %task_run.dot_id, state = %update.state, "Resumed task run");
        self.advance_locked(run_id).await
    }

    /// Fails every unfinished task of the run with `reason`, gives up on
    /// their transactions with `tx_reason` and finishes the run as errored.
    /// Returns false if the run had already finished.
    #[instrument(skip(self))]
    pub async fn abandon_run(
        &self,
        run_id: i64,
        reason: &str,
        tx_reason: &str,
    ) -> PipelineResult<bool> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let run = self.run(run_id).await?;
        if run.state.is_final() {
            return Ok(false);
        }
        let pipeline = Pipeline::parse(&self.spec(run.pipeline_spec_id).await?.source)?;
        let task_runs = self.ordered_task_runs(run_id, &pipeline).await?;

        let mut updates = Vec::new();
        for tr in task_runs.iter().filter(|t| !t.state.is_terminal()) {
            if tr.task_type == TaskType::EthTx.as_ref() {
                match self.inner.env.txs.abandon(tr.id, tx_reason).await {
                    Ok(abandoned) => debug!(task_run_id = %tr.id, abandoned, "Abandoned task transaction"),
                    Err(error) => warn!(task_run_id = %tr.id, %error, "Failed to abandon transaction"),
                }
            }
            updates.push(TaskRunUpdate {
                id: tr.id,
                state: TaskRunState::Errored,
                output: None,
                error: Some(reason.to_owned()),
            });
        }
        self.inner.store.save_task_results(&updates).await?;
        let task_runs = self.ordered_task_runs(run_id, &pipeline).await?;
        warn!(reason, "Abandoning pipeline run");
        self.finish(run_id, &pipeline, &task_runs, Some(RunState::Errored))
            .await?;
        Ok(true)
    }

    /// A run with its task runs.
    pub async fn get_run(&self, run_id: i64) -> PipelineResult<RunWithTasks> {
        let run = self.run(run_id).await?;
        let task_runs = self.inner.store.task_runs(run_id).await?;
        Ok(RunWithTasks { run, task_runs })
    }

    /// A page of runs, newest first, and the total count.
    pub async fn list_runs(
        &self,
        job_id: Option<i64>,
        offset: u64,
        limit: u64,
    ) -> PipelineResult<(Vec<PipelineRun>, u64)> {
        Ok(self.inner.store.list_runs(job_id, offset, limit).await?)
    }

    /// Runs of a job still executing tasks; suspended runs do not count.
    pub async fn count_running_runs(&self, job_id: i64) -> PipelineResult<u64> {
        Ok(self.inner.store.count_running_runs(job_id).await?)
    }

    /// Picks up work that was interrupted or whose resume was missed:
    /// advances runs left running and resumes suspended `ethtx` tasks whose
    /// transaction already has an outcome.
    pub async fn recover(&self) -> PipelineResult<()> {
        for run_id in self.inner.store.runs_in_state(RunState::Running).await? {
            if let Err(error) = self.advance(run_id).await {
                warn!(run_id, %error, "Failed to advance interrupted run");
            }
        }

        let suspended = self
            .inner
            .store
            .suspended_task_runs(TaskType::EthTx.as_ref())
            .await?;
        for tr in suspended {
            let outcome = match self.inner.env.txs.outcome(tr.id).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(error) => {
                    warn!(task_run_id = %tr.id, %error, "Failed to look up transaction outcome");
                    continue;
                }
            };
            match self.resume_task(tr.id, tx_result(outcome)).await {
                Ok(state) => info!(task_run_id = %tr.id, %state, "Resumed missed transaction outcome"),
                Err(PipelineError::Validation(_)) => {}
                Err(error) => warn!(task_run_id = %tr.id, %error, "Failed to resume task run"),
            }
        }
        Ok(())
    }

    fn lock_for(&self, run_id: i64) -> Arc<AsyncMutex<()>> {
        self.inner.locks.lock().entry(run_id).or_default().clone()
    }

    async fn run(&self, run_id: i64) -> PipelineResult<PipelineRun> {
        self.inner
            .store
            .run(run_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("pipeline run {run_id}")))
    }

    async fn spec(&self, spec_id: i64) -> PipelineResult<PipelineSpec> {
        self.inner
            .store
            .pipeline_spec(spec_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("pipeline spec {spec_id}")))
    }

    /// Task runs aligned with `pipeline.tasks`.
    async fn ordered_task_runs(
        &self,
        run_id: i64,
        pipeline: &Pipeline,
    ) -> PipelineResult<Vec<TaskRun>> {
        let mut by_dot_id: HashMap<String, TaskRun> = self
            .inner
            .store
            .task_runs(run_id)
            .await?
            .into_iter()
            .map(|t| (t.dot_id.clone(), t))
            .collect();
        pipeline
            .tasks
            .iter()
            .map(|t| {
                by_dot_id.remove(&t.dot_id).ok_or_else(|| {
                    PipelineError::InvalidDag(format!(
                        "run {run_id} has no task run for {:?}",
                        t.dot_id
                    ))
                })
            })
            .collect()
    }

    async fn advance_locked(&self, run_id: i64) -> PipelineResult<RunState> {
        let run = self.run(run_id).await?;
        if run.state.is_final() {
            return Ok(run.state);
        }
        let spec = self.spec(run.pipeline_spec_id).await?;
        let pipeline = Pipeline::parse(&spec.source)?;
        let timeout = spec
            .max_task_duration
            .unwrap_or(self.inner.env.config.max_task_duration);

        loop {
            let task_runs = self.ordered_task_runs(run_id, &pipeline).await?;
            let results: Vec<Option<TaskInput>> = task_runs.iter().map(TaskRun::result).collect();
            let ready: Vec<usize> = (0..task_runs.len())
                .filter(|&i| {
                    matches!(
                        task_runs[i].state,
                        TaskRunState::Pending | TaskRunState::Running
                    ) && pipeline.tasks[i]
                        .inputs
                        .iter()
                        .all(|&p| results[p].is_some())
                })
                .collect();

            if ready.is_empty() {
                if task_runs.iter().any(|t| t.state == TaskRunState::Suspended) {
                    self.inner
                        .store
                        .set_run_state(run_id, RunState::Suspended)
                        .await?;
                    debug!(run_id, "Pipeline run suspended");
                    return Ok(RunState::Suspended);
                }
                return self.finish(run_id, &pipeline, &task_runs, None).await;
            }

            let ids: Vec<Uuid> = ready.iter().map(|&i| task_runs[i].id).collect();
            self.inner.store.mark_task_runs_running(&ids).await?;
            let updates = join_all(ready.iter().map(|&i| {
                self.execute_task(&run, &pipeline, i, task_runs[i].id, &results, timeout)
            }))
            .await;
            self.inner.store.save_task_results(&updates).await?;
        }
    }

    async fn execute_task(
        &self,
        run: &PipelineRun,
        pipeline: &Pipeline,
        index: usize,
        task_run_id: Uuid,
        results: &[Option<TaskInput>],
        timeout: Duration,
    ) -> TaskRunUpdate {
        let spec = &pipeline.tasks[index];
        let task_type = spec.task_type.as_ref();
        let errored = |error: String| TaskRunUpdate {
            id: task_run_id,
            state: TaskRunState::Errored,
            output: None,
            error: Some(error),
        };

        let inputs: Vec<TaskInput> = spec
            .inputs
            .iter()
            .map(|&p| {
                results[p]
                    .clone()
                    .unwrap_or_else(|| Err("input not ready".into()))
            })
            .collect();
        if !spec.task_type.consumes_errors(&spec.attrs) {
            if let Some(Err(error)) = inputs.iter().find(|i| i.is_err()) {
                debug!(dot_id = %spec.dot_id, %error, "Upstream error");
                return errored(error.clone());
            }
        }

        let mut vars = Vars::new(run.inputs.clone());
        for ancestor in pipeline.ancestors(index) {
            if let Some(Ok(value)) = &results[ancestor] {
                vars.set(pipeline.tasks[ancestor].dot_id.clone(), value.clone());
            }
        }
        let ctx = TaskContext {
            env: &self.inner.env,
            run_id: run.id,
            task_run_id,
            spec,
            vars: &vars,
            inputs,
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, run_task(&ctx)).await;
        self.inner
            .metrics
            .task_duration
            .with_label_values(&[task_type])
            .observe(start.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(TaskOutcome::Value(value))) => TaskRunUpdate {
                id: task_run_id,
                state: TaskRunState::Completed,
                output: Some(value),
                error: None,
            },
            Ok(Ok(TaskOutcome::Pending)) => {
                self.inner.metrics.suspensions.inc();
                debug!(dot_id = %spec.dot_id, %task_run_id, "Task suspended");
                TaskRunUpdate {
                    id: task_run_id,
                    state: TaskRunState::Suspended,
                    output: None,
                    error: None,
                }
            }
            Ok(Err(error)) => {
                self.inner
                    .metrics
                    .task_errors
                    .with_label_values(&[task_type])
                    .inc();
                debug!(dot_id = %spec.dot_id, %error, "Task errored");
                errored(error.to_string())
            }
            Err(_) => {
                self.inner
                    .metrics
                    .task_errors
                    .with_label_values(&[task_type])
                    .inc();
                warn!(dot_id = %spec.dot_id, ?timeout, "Task timed out");
                errored(format!("task exceeded maximum duration of {timeout:?}"))
            }
        }
    }

    async fn finish(
        &self,
        run_id: i64,
        pipeline: &Pipeline,
        task_runs: &[TaskRun],
        forced: Option<RunState>,
    ) -> PipelineResult<RunState> {
        let sinks = pipeline.sinks();
        let results: Vec<Option<TaskInput>> = sinks.iter().map(|&i| task_runs[i].result()).collect();
        let outputs: Vec<Value> = results
            .iter()
            .map(|r| match r {
                Some(Ok(v)) => v.clone(),
                _ => Value::Null,
            })
            .collect();
        let errors: Vec<Value> = results
            .iter()
            .map(|r| match r {
                Some(Err(e)) => Value::String(e.clone()),
                _ => Value::Null,
            })
            .collect();
        let state = forced.unwrap_or(if results.iter().all(|r| matches!(r, Some(Ok(_)))) {
            RunState::Completed
        } else {
            RunState::Errored
        });

        self.inner
            .store
            .finish_run(
                run_id,
                state,
                &Value::Array(outputs),
                &Value::Array(errors),
            )
            .await?;
        self.inner
            .metrics
            .run_outcomes
            .with_label_values(&[state.as_ref()])
            .inc();
        self.inner.locks.lock().remove(&run_id);
        info!(run_id, %state, "Pipeline run finished");
        Ok(state)
    }
}

fn tx_result(outcome: TxOutcome) -> TaskInput {
    outcome.map(|hash| Value::String(format!("{hash:?}")))
}

/// Outcomes are recorded and the run advanced on a separate task, so the
/// confirmer's head callback never waits for downstream tasks or the run
/// lock. An outcome lost to a crash before it is recorded is picked up by
/// [`PipelineRunner::recover`].
#[async_trait]
impl ResumeCallback for PipelineRunner {
    async fn resume(&self, task_run_id: Uuid, outcome: TxOutcome) -> eyre::Result<()> {
        let runner = self.clone();
        tokio::spawn(
            async move {
                match runner.resume_task(task_run_id, tx_result(outcome)).await {
                    Ok(state) => debug!(%state, "Resumed run after transaction outcome"),
                    // resumed already, by the recovery loop or an earlier delivery
                    Err(PipelineError::Validation(_)) => {
                        debug!("Task run is not suspended, ignoring outcome")
                    }
                    Err(error) => warn!(%error, "Failed to resume task run"),
                }
            }
            .instrument(info_span!("ResumeTask", %task_run_id)),
        );
        Ok(())
    }
}
