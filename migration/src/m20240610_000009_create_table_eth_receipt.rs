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
                    .table(EthReceipt::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EthReceipt::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EthReceipt::TimeCreated).timestamp().not_null())
                    .col(
                        ColumnDef::new_with_type(EthReceipt::TxHash, Hash)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new_with_type(EthReceipt::BlockHash, Hash).not_null())
                    .col(ColumnDef::new(EthReceipt::BlockNumber).big_integer().not_null())
                    .col(
                        ColumnDef::new(EthReceipt::TransactionIndex)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(EthReceipt::Status).boolean())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EthReceipt::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum EthReceipt {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Hash of the mined attempt
    TxHash,
    /// Containing block
    BlockHash,
    /// Containing block number
    BlockNumber,
    /// Index in the block
    TransactionIndex,
    /// Execution status, false when reverted
    Status,
}
