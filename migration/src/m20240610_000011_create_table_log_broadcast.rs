use sea_orm_migration::prelude::*;

use crate::l20240610_types::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LogBroadcast::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LogBroadcast::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LogBroadcast::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(LogBroadcast::JobId).big_integer().not_null())
                    .col(ColumnDef::new_with_type(LogBroadcast::BlockHash, Hash).not_null())
                    .col(ColumnDef::new(LogBroadcast::BlockNumber).big_integer().not_null())
                    .col(ColumnDef::new(LogBroadcast::LogIndex).big_integer().not_null())
                    .col(ColumnDef::new(LogBroadcast::PipelineRunId).big_integer())
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(LogBroadcast::Table)
                    .name("log_broadcast_job_block_log_idx")
                    .col(LogBroadcast::JobId)
                    .col(LogBroadcast::BlockHash)
                    .col(LogBroadcast::LogIndex)
                    .unique()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LogBroadcast::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum LogBroadcast {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Job that consumed the log
    JobId,
    /// Block containing the log
    BlockHash,
    /// Number of that block
    BlockNumber,
    /// Index of the log in the block
    LogIndex,
    /// Run started for the log
    PipelineRunId,
}
