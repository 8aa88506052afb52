use std::{fmt::Debug, str::FromStr, time::Duration};

use async_trait::async_trait;
use auto_impl::auto_impl;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::*, ColumnTrait, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use oracle_base::db::{
    generated::{pipeline_run, pipeline_spec, task_run},
    i64_to_u64, now, to_chrono, u64_to_i64, OracleDb,
};

use crate::{PipelineRun, PipelineSpec, RunState, TaskRun, TaskRunState, TaskRunUpdate};

/// A task run to create along with its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaskRun {
    /// Externally visible id
    pub id: Uuid,
    /// Id of the task in the pipeline source
    pub dot_id: String,
    /// Task type name
    pub task_type: String,
    /// Topological position
    pub index: i32,
}

/// Persistence of pipelines and their runs.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait RunStore: Send + Sync + Debug {
    /// Stores a pipeline source.
    async fn insert_pipeline_spec(
        &self,
        source: &str,
        max_task_duration: Option<Duration>,
    ) -> Result<PipelineSpec, DbErr>;

    /// Pipeline by id.
    async fn pipeline_spec(&self, id: i64) -> Result<Option<PipelineSpec>, DbErr>;

    /// Creates a running run and its pending task runs in one transaction.
    async fn create_run(
        &self,
        pipeline_spec_id: i64,
        job_id: Option<i64>,
        inputs: &Value,
        tasks: &[NewTaskRun],
    ) -> Result<PipelineRun, DbErr>;

    /// Run by id.
    async fn run(&self, id: i64) -> Result<Option<PipelineRun>, DbErr>;

    /// Task runs of a run in topological order.
    async fn task_runs(&self, run_id: i64) -> Result<Vec<TaskRun>, DbErr>;

    /// Task run by its external id.
    async fn task_run(&self, id: Uuid) -> Result<Option<TaskRun>, DbErr>;

    /// Moves the given task runs to `running`.
    async fn mark_task_runs_running(&self, ids: &[Uuid]) -> Result<(), DbErr>;

    /// Records task results in one transaction.
    async fn save_task_results(&self, updates: &[TaskRunUpdate]) -> Result<(), DbErr>;

    /// Records the result of a suspended task and moves its run back to
    /// running, in one transaction. Returns false if the task was not
    /// suspended.
    async fn resume_task_run(&self, update: &TaskRunUpdate, run_id: i64) -> Result<bool, DbErr>;

    /// Sets the state of an unfinished run.
    async fn set_run_state(&self, run_id: i64, state: RunState) -> Result<(), DbErr>;

    /// Finishes a run with its outputs and errors.
    async fn finish_run(
        &self,
        run_id: i64,
        state: RunState,
        outputs: &Value,
        errors: &Value,
    ) -> Result<(), DbErr>;

    /// A page of runs, newest first, and the total count.
    async fn list_runs(
        &self,
        job_id: Option<i64>,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<PipelineRun>, u64), DbErr>;

    /// Ids of the runs in `state`.
    async fn runs_in_state(&self, state: RunState) -> Result<Vec<i64>, DbErr>;

    /// Runs of a job still executing tasks.
    async fn count_running_runs(&self, job_id: i64) -> Result<u64, DbErr>;

    /// Suspended task runs of a type.
    async fn suspended_task_runs(&self, task_type: &str) -> Result<Vec<TaskRun>, DbErr>;
}

fn parse_state<T: FromStr>(s: &str) -> Result<T, DbErr> {
    s.parse()
        .map_err(|_| DbErr::Custom(format!("unknown state {s:?}")))
}

fn spec_from_model(m: pipeline_spec::Model) -> PipelineSpec {
    PipelineSpec {
        id: m.id,
        source: m.dot_dag_source,
        max_task_duration: m
            .max_task_duration_ms
            .map(|ms| Duration::from_millis(i64_to_u64(ms))),
    }
}

fn run_from_model(m: pipeline_run::Model) -> Result<PipelineRun, DbErr> {
    Ok(PipelineRun {
        id: m.id,
        pipeline_spec_id: m.pipeline_spec_id,
        job_id: m.job_id,
        inputs: m.inputs,
        outputs: m.outputs,
        errors: m.errors,
        state: parse_state(&m.state)?,
        created_at: to_chrono(m.time_created),
        finished_at: m.time_finished.map(to_chrono),
    })
}

fn task_run_from_model(m: task_run::Model) -> Result<TaskRun, DbErr> {
    Ok(TaskRun {
        id: m.id,
        pipeline_run_id: m.pipeline_run_id,
        dot_id: m.dot_id,
        task_type: m.task_type,
        index: m.idx,
        output: m.output,
        error: m.error,
        state: parse_state(&m.state)?,
        created_at: to_chrono(m.time_created),
        finished_at: m.time_finished.map(to_chrono),
    })
}

fn finished_at(state: TaskRunState) -> Option<sea_orm::prelude::TimeDateTime> {
    state.is_terminal().then(now)
}

#[async_trait]
impl RunStore for OracleDb {
    async fn insert_pipeline_spec(
        &self,
        source: &str,
        max_task_duration: Option<Duration>,
    ) -> Result<PipelineSpec, DbErr> {
        let model = pipeline_spec::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            dot_dag_source: Set(source.to_owned()),
            max_task_duration_ms: Set(max_task_duration.map(|d| u64_to_i64(d.as_millis() as u64))),
        }
        .insert(self.conn())
        .await?;
        Ok(spec_from_model(model))
    }

    async fn pipeline_spec(&self, id: i64) -> Result<Option<PipelineSpec>, DbErr> {
        Ok(pipeline_spec::Entity::find_by_id(id)
            .one(self.conn())
            .await?
            .map(spec_from_model))
    }

    #[instrument(skip(self, inputs, tasks), fields(tasks = tasks.len()))]
    async fn create_run(
        &self,
        pipeline_spec_id: i64,
        job_id: Option<i64>,
        inputs: &Value,
        tasks: &[NewTaskRun],
    ) -> Result<PipelineRun, DbErr> {
        let txn = self.conn().begin().await?;
        let run = pipeline_run::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            time_finished: Set(None),
            pipeline_spec_id: Set(pipeline_spec_id),
            job_id: Set(job_id),
            state: Set(RunState::Running.to_string()),
            inputs: Set(inputs.clone()),
            outputs: Set(None),
            errors: Set(None),
        }
        .insert(&txn)
        .await?;
        if !tasks.is_empty() {
            let created = now();
            task_run::Entity::insert_many(tasks.iter().map(|t| task_run::ActiveModel {
                id: Set(t.id),
                time_created: Set(created),
                time_finished: Set(None),
                pipeline_run_id: Set(run.id),
                dot_id: Set(t.dot_id.clone()),
                task_type: Set(t.task_type.clone()),
                idx: Set(t.index),
                state: Set(TaskRunState::Pending.to_string()),
                output: Set(None),
                error: Set(None),
            }))
            .exec_without_returning(&txn)
            .await?;
        }
        txn.commit().await?;
        run_from_model(run)
    }

    async fn run(&self, id: i64) -> Result<Option<PipelineRun>, DbErr> {
        pipeline_run::Entity::find_by_id(id)
            .one(self.conn())
            .await?
            .map(run_from_model)
            .transpose()
    }

    async fn task_runs(&self, run_id: i64) -> Result<Vec<TaskRun>, DbErr> {
        task_run::Entity::find()
            .filter(task_run::Column::PipelineRunId.eq(run_id))
            .order_by_asc(task_run::Column::Idx)
            .all(self.conn())
            .await?
            .into_iter()
            .map(task_run_from_model)
            .collect()
    }

    async fn task_run(&self, id: Uuid) -> Result<Option<TaskRun>, DbErr> {
        task_run::Entity::find_by_id(id)
            .one(self.conn())
            .await?
            .map(task_run_from_model)
            .transpose()
    }

    async fn mark_task_runs_running(&self, ids: &[Uuid]) -> Result<(), DbErr> {
        if ids.is_empty() {
            return Ok(());
        }
        task_run::Entity::update_many()
            .col_expr(
                task_run::Column::State,
                Expr::value(TaskRunState::Running.to_string()),
            )
            .filter(task_run::Column::Id.is_in(ids.iter().copied()))
            .exec(self.conn())
            .await?;
        Ok(())
    }

    async fn save_task_results(&self, updates: &[TaskRunUpdate]) -> Result<(), DbErr> {
        let txn = self.conn().begin().await?;
        for u in updates {
            task_run::Entity::update_many()
                .col_expr(task_run::Column::State, Expr::value(u.state.to_string()))
                .col_expr(task_run::Column::Output, Expr::value(u.output.clone()))
                .col_expr(task_run::Column::Error, Expr::value(u.error.clone()))
                .col_expr(task_run::Column::TimeFinished, Expr::value(finished_at(u.state)))
                .filter(task_run::Column::Id.eq(u.id))
                .exec(&txn)
                .await?;
        }
        txn.commit().await
    }

    #[instrument(skip(self, update), fields(task_run_id = %update.id))]
    async fn resume_task_run(&self, update: &TaskRunUpdate, run_id: i64) -> Result<bool, DbErr> {
        let txn = self.conn().begin().await?;
        let res = task_run::Entity::update_many()
            .col_expr(task_run::Column::State, Expr::value(update.state.to_string()))
            .col_expr(task_run::Column::Output, Expr::value(update.output.clone()))
            .col_expr(task_run::Column::Error, Expr::value(update.error.clone()))
            .col_expr(
                task_run::Column::TimeFinished,
                Expr::value(finished_at(update.state)),
            )
            .filter(task_run::Column::Id.eq(update.id))
            .filter(task_run::Column::State.eq(TaskRunState::Suspended.to_string()))
            .exec(&txn)
            .await?;
        if res.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(false);
        }
        pipeline_run::Entity::update_many()
            .col_expr(
                pipeline_run::Column::State,
                Expr::value(RunState::Running.to_string()),
            )
            .filter(pipeline_run::Column::Id.eq(run_id))
            .filter(pipeline_run::Column::TimeFinished.is_null())
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn set_run_state(&self, run_id: i64, state: RunState) -> Result<(), DbErr> {
        pipeline_run::Entity::update_many()
            .col_expr(pipeline_run::Column::State, Expr::value(state.to_string()))
            .filter(pipeline_run::Column::Id.eq(run_id))
            .filter(pipeline_run::Column::TimeFinished.is_null())
            .exec(self.conn())
            .await?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: i64,
        state: RunState,
        outputs: &Value,
        errors: &Value,
    ) -> Result<(), DbErr> {
        pipeline_run::Entity::update_many()
            .col_expr(pipeline_run::Column::State, Expr::value(state.to_string()))
            .col_expr(pipeline_run::Column::Outputs, Expr::value(Some(outputs.clone())))
            .col_expr(pipeline_run::Column::Errors, Expr::value(Some(errors.clone())))
            .col_expr(pipeline_run::Column::TimeFinished, Expr::value(Some(now())))
            .filter(pipeline_run::Column::Id.eq(run_id))
            .filter(pipeline_run::Column::TimeFinished.is_null())
            .exec(self.conn())
            .await?;
        Ok(())
    }

    async fn list_runs(
        &self,
        job_id: Option<i64>,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<PipelineRun>, u64), DbErr> {
        let mut query = pipeline_run::Entity::find();
        if let Some(job_id) = job_id {
            query = query.filter(pipeline_run::Column::JobId.eq(job_id));
        }
        let total = query.clone().count(self.conn()).await?;
        let runs = query
            .order_by_desc(pipeline_run::Column::Id)
            .offset(offset)
            .limit(limit)
            .all(self.conn())
            .await?
            .into_iter()
            .map(run_from_model)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((runs, total))
    }

    async fn runs_in_state(&self, state: RunState) -> Result<Vec<i64>, DbErr> {
        Ok(pipeline_run::Entity::find()
            .filter(pipeline_run::Column::State.eq(state.to_string()))
            .order_by_asc(pipeline_run::Column::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect())
    }

    async fn count_running_runs(&self, job_id: i64) -> Result<u64, DbErr> {
        pipeline_run::Entity::find()
            .filter(pipeline_run::Column::JobId.eq(job_id))
            .filter(pipeline_run::Column::State.eq(RunState::Running.to_string()))
            .count(self.conn())
            .await
    }

    async fn suspended_task_runs(&self, task_type: &str) -> Result<Vec<TaskRun>, DbErr> {
        task_run::Entity::find()
            .filter(task_run::Column::TaskType.eq(task_type))
            .filter(task_run::Column::State.eq(TaskRunState::Suspended.to_string()))
            .order_by_asc(task_run::Column::TimeCreated)
            .all(self.conn())
            .await?
            .into_iter()
            .map(task_run_from_model)
            .collect()
    }
}
