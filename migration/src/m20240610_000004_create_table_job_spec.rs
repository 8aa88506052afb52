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
                    .table(JobSpec::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobSpec::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobSpec::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(JobSpec::TimeDeleted).timestamp())
                    .col(
                        ColumnDef::new(JobSpec::ExternalJobId)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(JobSpec::Name).text())
                    .col(ColumnDef::new(JobSpec::JobType).string_len(32).not_null())
                    .col(ColumnDef::new(JobSpec::SchemaVersion).integer().not_null())
                    .col(ColumnDef::new(JobSpec::PipelineSpecId).big_integer().not_null())
                    .col(ColumnDef::new(JobSpec::TypeSpec).json().not_null())
                    .col(ColumnDef::new(JobSpec::SourceToml).text().not_null())
                    .col(ColumnDef::new(JobSpec::WebhookTokenHash).string_len(64))
                    .foreign_key(
                        ForeignKey::create()
                            .from_col(JobSpec::PipelineSpecId)
                            .to(PipelineSpec::Table, PipelineSpec::Id),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobSpec::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum JobSpec {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Set when the job is deleted; the row is kept as a tombstone
    TimeDeleted,
    /// Externally visible job id
    ExternalJobId,
    /// Operator supplied name
    Name,
    /// cron, directrequest, webhook, ...
    JobType,
    /// Version of the job spec format
    SchemaVersion,
    /// Pipeline this job runs
    PipelineSpecId,
    /// Type specific settings as JSON
    TypeSpec,
    /// The TOML the job was created from
    SourceToml,
    /// SHA3-256 hex of the webhook access token
    WebhookTokenHash,
}
