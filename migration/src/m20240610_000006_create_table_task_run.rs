use sea_orm_migration::prelude::*;

use crate::m20240610_000005_create_table_pipeline_run::PipelineRun;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TaskRun::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(TaskRun::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(TaskRun::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(TaskRun::TimeFinished).timestamp())
                    .col(ColumnDef::new(TaskRun::PipelineRunId).big_integer().not_null())
                    .col(ColumnDef::new(TaskRun::DotId).text().not_null())
                    .col(ColumnDef::new(TaskRun::TaskType).string_len(32).not_null())
                    .col(ColumnDef::new(TaskRun::Idx).integer().not_null())
                    .col(ColumnDef::new(TaskRun::State).string_len(16).not_null())
                    .col(ColumnDef::new(TaskRun::Output).json())
                    .col(ColumnDef::new(TaskRun::Error).text())
                    .foreign_key(
                        ForeignKey::create()
                            .from_col(TaskRun::PipelineRunId)
                            .to(PipelineRun::Table, PipelineRun::Id),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(TaskRun::Table)
                    .name("task_run_pipeline_run_dot_id_idx")
                    .col(TaskRun::PipelineRunId)
                    .col(TaskRun::DotId)
                    .unique()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TaskRun::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum TaskRun {
    Table,
    /// Externally visible id, used to resume suspended tasks
    Id,
    /// Time of record creation
    TimeCreated,
    /// Time the task reached a terminal state
    TimeFinished,
    /// Owning run
    PipelineRunId,
    /// Task id within the pipeline
    DotId,
    /// Task type name
    TaskType,
    /// Topological index of the task
    Idx,
    /// pending, running, completed, errored or suspended
    State,
    /// Output value
    Output,
    /// Error message
    Error,
}
