use sea_orm_migration::prelude::*;

use crate::m20240610_000003_create_table_pipeline_spec::PipelineSpec;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PipelineRun::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PipelineRun::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PipelineRun::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(PipelineRun::TimeFinished).timestamp())
                    .col(ColumnDef::new(PipelineRun::PipelineSpecId).big_integer().not_null())
                    .col(ColumnDef::new(PipelineRun::JobId).big_integer())
                    .col(ColumnDef::new(PipelineRun::State).string_len(16).not_null())
                    .col(ColumnDef::new(PipelineRun::Inputs).json().not_null())
                    .col(ColumnDef::new(PipelineRun::Outputs).json())
                    .col(ColumnDef::new(PipelineRun::Errors).json())
                    .foreign_key(
                        ForeignKey::create()
                            .from_col(PipelineRun::PipelineSpecId)
                            .to(PipelineSpec::Table, PipelineSpec::Id),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(PipelineRun::Table)
                    .name("pipeline_run_state_idx")
                    .col(PipelineRun::State)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(PipelineRun::Table)
                    .name("pipeline_run_job_idx")
                    .col(PipelineRun::JobId)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PipelineRun::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum PipelineRun {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Time the run reached a terminal state
    TimeFinished,
    /// Pipeline being run
    PipelineSpecId,
    /// Job that started the run, if any
    JobId,
    /// running, suspended, completed or errored
    State,
    /// Run level vars
    Inputs,
    /// Values of the result sinks
    Outputs,
    /// Errors of the result sinks
    Errors,
}
