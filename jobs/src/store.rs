use std::{collections::HashMap, fmt::Debug, time::Duration};

use async_trait::async_trait;
use auto_impl::auto_impl;
use sea_orm::{
    sea_query::{Expr, OnConflict, SimpleExpr},
    ActiveModelTrait, ActiveValue::*, ColumnTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};
use tracing::instrument;

use oracle_base::db::{
    bytes_to_h256,
    generated::{job_spec, log_broadcast, pipeline_run, pipeline_spec},
    h256_to_bytes, i64_to_u64, now, to_chrono, u64_to_i64, OracleDb,
};
use oracle_core::{Log, H256};

use crate::{JobKind, JobSpec, NewJob};

/// A request log a job already started a run for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedLog {
    /// Block the log was seen in
    pub block_hash: H256,
    /// Number of that block
    pub block_number: u64,
    /// Index of the log in the block
    pub log_index: u64,
    /// Run started for the log, once known
    pub pipeline_run_id: Option<i64>,
}

/// Persistence of jobs and of the logs they consumed.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait JobStore: Send + Sync + Debug {
    /// Stores the job and its pipeline together. Returns `None` when the
    /// external id is taken.
    async fn insert_job(
        &self,
        job: &NewJob,
        webhook_token_hash: Option<String>,
    ) -> Result<Option<JobSpec>, DbErr>;

    /// Job by id, unless deleted.
    async fn job(&self, id: i64) -> Result<Option<JobSpec>, DbErr>;

    /// Job by external id, unless deleted.
    async fn job_by_external_id(
        &self,
        external_job_id: uuid::Uuid,
    ) -> Result<Option<JobSpec>, DbErr>;

    /// Every job not deleted, by id.
    async fn jobs(&self) -> Result<Vec<JobSpec>, DbErr>;

    /// Marks a job deleted. Returns false if it was already.
    async fn tombstone_job(&self, id: i64) -> Result<bool, DbErr>;

    /// Erases a job that never ran, together with its pipeline and the logs
    /// it consumed, freeing its external id. Returns false if there was no
    /// such job.
    async fn remove_job(&self, id: i64) -> Result<bool, DbErr>;

    /// Records that `job_id` consumed `log`. Returns false if it already
    /// had.
    async fn mark_log_consumed(&self, job_id: i64, log: &Log) -> Result<bool, DbErr>;

    /// Forgets a consumed log whose run could not be started.
    async fn unmark_log(&self, job_id: i64, log: &Log) -> Result<(), DbErr>;

    /// Links a consumed log to the run it started.
    async fn set_log_run(&self, job_id: i64, log: &Log, run_id: i64) -> Result<(), DbErr>;

    /// Logs consumed by `job_id` in blocks from `from_block` on.
    async fn consumed_logs_since(
        &self,
        job_id: i64,
        from_block: u64,
    ) -> Result<Vec<ConsumedLog>, DbErr>;
}

fn job_from_model(m: job_spec::Model, pipeline: pipeline_spec::Model) -> Result<JobSpec, DbErr> {
    let kind: JobKind = serde_json::from_value(m.type_spec)
        .map_err(|e| DbErr::Custom(format!("bad type spec of job {}: {e}", m.id)))?;
    Ok(JobSpec {
        id: m.id,
        external_job_id: m.external_job_id,
        name: m.name,
        schema_version: u32::try_from(m.schema_version).unwrap_or_default(),
        pipeline_spec_id: m.pipeline_spec_id,
        pipeline_source: pipeline.dot_dag_source,
        max_task_duration: pipeline
            .max_task_duration_ms
            .map(|ms| Duration::from_millis(i64_to_u64(ms))),
        kind,
        source: m.source_toml,
        webhook_token_hash: m.webhook_token_hash,
        created_at: to_chrono(m.time_created),
    })
}

async fn with_pipelines(
    db: &OracleDb,
    models: Vec<job_spec::Model>,
) -> Result<Vec<JobSpec>, DbErr> {
    let ids: Vec<i64> = models.iter().map(|m| m.pipeline_spec_id).collect();
    let mut pipelines: HashMap<i64, pipeline_spec::Model> = pipeline_spec::Entity::find()
        .filter(pipeline_spec::Column::Id.is_in(ids))
        .all(db.conn())
        .await?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();
    models
        .into_iter()
        .map(|m| {
            let pipeline = pipelines.remove(&m.pipeline_spec_id).ok_or_else(|| {
                DbErr::RecordNotFound(format!("pipeline spec {}", m.pipeline_spec_id))
            })?;
            job_from_model(m, pipeline)
        })
        .collect()
}

async fn live_job(db: &OracleDb, filter: SimpleExpr) -> Result<Option<JobSpec>, DbErr> {
    let Some(model) = job_spec::Entity::find()
        .filter(filter)
        .filter(job_spec::Column::TimeDeleted.is_null())
        .one(db.conn())
        .await?
    else {
        return Ok(None);
    };
    Ok(with_pipelines(db, vec![model]).await?.pop())
}

fn log_filter(job_id: i64, log: &Log) -> sea_orm::Condition {
    sea_orm::Condition::all()
        .add(log_broadcast::Column::JobId.eq(job_id))
        .add(log_broadcast::Column::BlockHash.eq(h256_to_bytes(&log.block_hash)))
        .add(log_broadcast::Column::LogIndex.eq(u64_to_i64(log.log_index)))
}

#[async_trait]
impl JobStore for OracleDb {
    #[instrument(skip_all, fields(external_job_id = %job.external_job_id))]
    async fn insert_job(
        &self,
        job: &NewJob,
        webhook_token_hash: Option<String>,
    ) -> Result<Option<JobSpec>, DbErr> {
        let type_spec = serde_json::to_value(&job.kind)
            .map_err(|e| DbErr::Custom(format!("unserializable type spec: {e}")))?;

        let txn = self.conn().begin().await?;
        let taken = job_spec::Entity::find()
            .filter(job_spec::Column::ExternalJobId.eq(job.external_job_id))
            .one(&txn)
            .await?
            .is_some();
        if taken {
            txn.rollback().await?;
            return Ok(None);
        }
        let pipeline = pipeline_spec::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            dot_dag_source: Set(job.pipeline_source.clone()),
            max_task_duration_ms: Set(job
                .max_task_duration
                .map(|d| u64_to_i64(d.as_millis() as u64))),
        }
        .insert(&txn)
        .await?;
        let model = job_spec::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            time_deleted: Set(None),
            external_job_id: Set(job.external_job_id),
            name: Set(job.name.clone()),
            job_type: Set(job.kind.job_type().to_string()),
            schema_version: Set(job.schema_version as i32),
            pipeline_spec_id: Set(pipeline.id),
            type_spec: Set(type_spec),
            source_toml: Set(job.source.clone()),
            webhook_token_hash: Set(webhook_token_hash),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;
        job_from_model(model, pipeline).map(Some)
    }

    async fn job(&self, id: i64) -> Result<Option<JobSpec>, DbErr> {
        live_job(self, job_spec::Column::Id.eq(id)).await
    }

    async fn job_by_external_id(
        &self,
        external_job_id: uuid::Uuid,
    ) -> Result<Option<JobSpec>, DbErr> {
        live_job(self, job_spec::Column::ExternalJobId.eq(external_job_id)).await
    }

    async fn jobs(&self) -> Result<Vec<JobSpec>, DbErr> {
        let models = job_spec::Entity::find()
            .filter(job_spec::Column::TimeDeleted.is_null())
            .order_by_asc(job_spec::Column::Id)
            .all(self.conn())
            .await?;
        with_pipelines(self, models).await
    }

    async fn tombstone_job(&self, id: i64) -> Result<bool, DbErr> {
        let res = job_spec::Entity::update_many()
            .col_expr(job_spec::Column::TimeDeleted, Expr::value(now()))
            .filter(job_spec::Column::Id.eq(id))
            .filter(job_spec::Column::TimeDeleted.is_null())
            .exec(self.conn())
            .await?;
        Ok(res.rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn remove_job(&self, id: i64) -> Result<bool, DbErr> {
        let txn = self.conn().begin().await?;
        let Some(job) = job_spec::Entity::find_by_id(id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(false);
        };
        log_broadcast::Entity::delete_many()
            .filter(log_broadcast::Column::JobId.eq(id))
            .exec(&txn)
            .await?;
        job_spec::Entity::delete_by_id(id).exec(&txn).await?;
        let runs = pipeline_run::Entity::find()
            .filter(pipeline_run::Column::PipelineSpecId.eq(job.pipeline_spec_id))
            .count(&txn)
            .await?;
        if runs == 0 {
            pipeline_spec::Entity::delete_by_id(job.pipeline_spec_id)
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(true)
    }

    async fn mark_log_consumed(&self, job_id: i64, log: &Log) -> Result<bool, DbErr> {
        let model = log_broadcast::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            job_id: Set(job_id),
            block_hash: Set(h256_to_bytes(&log.block_hash)),
            block_number: Set(u64_to_i64(log.block_number)),
            log_index: Set(u64_to_i64(log.log_index)),
            pipeline_run_id: Set(None),
        };
        match log_broadcast::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    log_broadcast::Column::JobId,
                    log_broadcast::Column::BlockHash,
                    log_broadcast::Column::LogIndex,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.conn())
            .await
        {
            Ok(inserted) => Ok(inserted > 0),
            Err(DbErr::RecordNotInserted) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn unmark_log(&self, job_id: i64, log: &Log) -> Result<(), DbErr> {
        log_broadcast::Entity::delete_many()
            .filter(log_filter(job_id, log))
            .exec(self.conn())
            .await?;
        Ok(())
    }

    async fn set_log_run(&self, job_id: i64, log: &Log, run_id: i64) -> Result<(), DbErr> {
        log_broadcast::Entity::update_many()
            .col_expr(log_broadcast::Column::PipelineRunId, Expr::value(run_id))
            .filter(log_filter(job_id, log))
            .exec(self.conn())
            .await?;
        Ok(())
    }

    async fn consumed_logs_since(
        &self,
        job_id: i64,
        from_block: u64,
    ) -> Result<Vec<ConsumedLog>, DbErr> {
        log_broadcast::Entity::find()
            .filter(log_broadcast::Column::JobId.eq(job_id))
            .filter(log_broadcast::Column::BlockNumber.gte(u64_to_i64(from_block)))
            .order_by_asc(log_broadcast::Column::BlockNumber)
            .order_by_asc(log_broadcast::Column::LogIndex)
            .all(self.conn())
            .await?
            .into_iter()
            .map(|m| {
                Ok(ConsumedLog {
                    block_hash: bytes_to_h256(&m.block_hash)?,
                    block_number: i64_to_u64(m.block_number),
                    log_index: i64_to_u64(m.log_index),
                    pipeline_run_id: m.pipeline_run_id,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use oracle_core::{Address, Bytes};

    use super::*;

    fn new_job(kind: JobKind) -> NewJob {
        NewJob {
            external_job_id: uuid::Uuid::new_v4(),
            name: Some("test".into()),
            schema_version: 1,
            pipeline_source: "a [type=any];".into(),
            max_task_duration: Some(Duration::from_secs(3)),
            kind,
            source: "type = \"webhook\"".into(),
        }
    }

    fn log(block: u64, index: u64) -> Log {
        Log {
            address: Address::repeat_byte(1),
            topics: vec![],
            data: Bytes::default(),
            block_hash: H256::from_low_u64_be(block),
            block_number: block,
            tx_hash: H256::zero(),
            tx_index: 0,
            log_index: index,
            removed: false,
        }
    }

    #[tokio::test]
    async fn jobs_round_trip_and_tombstone() {
        let db = OracleDb::in_memory().await.unwrap();
        let new = new_job(JobKind::Webhook);
        let job = db
            .insert_job(&new, Some("hash".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.kind, JobKind::Webhook);
        assert_eq!(job.max_task_duration, Some(Duration::from_secs(3)));
        assert_eq!(job.webhook_token_hash.as_deref(), Some("hash"));
        let stored = db.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.external_job_id, new.external_job_id);
        assert_eq!(stored.pipeline_source, "a [type=any];");
        assert_eq!(stored.name.as_deref(), Some("test"));
        assert_eq!(
            db.job_by_external_id(new.external_job_id)
                .await
                .unwrap()
                .map(|j| j.id),
            Some(job.id)
        );

        // the external id is unique
        assert_eq!(db.insert_job(&new, None).await.unwrap(), None);

        let cron = db
            .insert_job(
                &new_job(JobKind::Cron {
                    schedule: "CRON_TZ=UTC * * * * * *".into(),
                }),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<i64> = db.jobs().await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![job.id, cron.id]);

        assert!(db.tombstone_job(job.id).await.unwrap());
        assert!(!db.tombstone_job(job.id).await.unwrap());
        assert_eq!(db.job(job.id).await.unwrap(), None);
        let ids: Vec<i64> = db.jobs().await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![cron.id]);
    }

    #[tokio::test]
    async fn removed_jobs_free_their_external_id() {
        let db = OracleDb::in_memory().await.unwrap();
        let new = new_job(JobKind::Webhook);
        let job = db.insert_job(&new, None).await.unwrap().unwrap();
        assert!(db.mark_log_consumed(job.id, &log(3, 0)).await.unwrap());

        assert!(db.remove_job(job.id).await.unwrap());
        assert!(!db.remove_job(job.id).await.unwrap());
        assert_eq!(db.job(job.id).await.unwrap(), None);
        assert!(db.consumed_logs_since(job.id, 0).await.unwrap().is_empty());

        let again = db.insert_job(&new, None).await.unwrap().unwrap();
        assert_ne!(again.id, job.id);
        assert_eq!(again.external_job_id, new.external_job_id);
    }

    #[tokio::test]
    async fn logs_are_consumed_once_per_job() {
        let db = OracleDb::in_memory().await.unwrap();
        let first = log(10, 0);
        assert!(db.mark_log_consumed(1, &first).await.unwrap());
        assert!(!db.mark_log_consumed(1, &first).await.unwrap());
        assert!(db.mark_log_consumed(2, &first).await.unwrap());
        assert!(db.mark_log_consumed(1, &log(10, 1)).await.unwrap());
        assert!(db.mark_log_consumed(1, &log(12, 0)).await.unwrap());

        db.set_log_run(1, &first, 77).await.unwrap();
        let consumed = db.consumed_logs_since(1, 10).await.unwrap();
        assert_eq!(consumed.len(), 3);
        assert_eq!(consumed[0].pipeline_run_id, Some(77));
        assert_eq!(consumed[0].block_hash, first.block_hash);
        assert_eq!(consumed[2].block_number, 12);
        assert_eq!(db.consumed_logs_since(1, 11).await.unwrap().len(), 1);

        db.unmark_log(1, &first).await.unwrap();
        assert!(db.mark_log_consumed(1, &first).await.unwrap());
    }
}
