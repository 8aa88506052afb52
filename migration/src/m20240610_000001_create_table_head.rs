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
                    .table(Head::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Head::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Head::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new_with_type(Head::Hash, Hash).not_null().unique_key())
                    .col(ColumnDef::new(Head::Number).big_integer().not_null())
                    .col(ColumnDef::new_with_type(Head::ParentHash, Hash).not_null())
                    .col(ColumnDef::new(Head::Timestamp).timestamp().not_null())
                    .col(ColumnDef::new(Head::L1BlockNumber).big_integer())
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(Head::Table)
                    .name("head_number_idx")
                    .col(Head::Number)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Head::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum Head {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Block hash
    Hash,
    /// Block height
    Number,
    /// Hash of the parent block
    ParentHash,
    /// Block timestamp
    Timestamp,
    /// L1 block number reported by L2 chains
    L1BlockNumber,
}
