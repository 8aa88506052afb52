use sea_orm_migration::prelude::*;

use crate::l20240610_types::*;
use crate::m20240610_000007_create_table_eth_tx::EthTx;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EthTxAttempt::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EthTxAttempt::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EthTxAttempt::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(EthTxAttempt::TimeBroadcast).timestamp())
                    .col(ColumnDef::new(EthTxAttempt::EthTxId).big_integer().not_null())
                    .col(
                        ColumnDef::new_with_type(EthTxAttempt::Hash, Hash)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(EthTxAttempt::GasPrice)
                            .string_len(SIGNIFICANT_DIGITS_IN_256_BIT_INTEGER)
                            .not_null(),
                    )
                    .col(ColumnDef::new_with_type(EthTxAttempt::SignedRawTx, Bytes).not_null())
                    .col(ColumnDef::new(EthTxAttempt::State).string_len(16).not_null())
                    .col(ColumnDef::new(EthTxAttempt::BroadcastBeforeBlockNumber).big_integer())
                    .foreign_key(
                        ForeignKey::create()
                            .from_col(EthTxAttempt::EthTxId)
                            .to(EthTx::Table, EthTx::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(EthTxAttempt::Table)
                    .name("eth_tx_attempt_eth_tx_idx")
                    .col(EthTxAttempt::EthTxId)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EthTxAttempt::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum EthTxAttempt {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Time this attempt was last sent
    TimeBroadcast,
    /// Owning transaction
    EthTxId,
    /// Hash of the signed transaction
    Hash,
    /// Gas price in wei, base-10
    GasPrice,
    /// Signed RLP bytes
    SignedRawTx,
    /// in_progress, broadcast or confirmed
    State,
    /// First head number seen after this attempt was broadcast
    BroadcastBeforeBlockNumber,
}
