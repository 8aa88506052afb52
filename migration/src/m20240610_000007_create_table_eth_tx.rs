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
                    .table(EthTx::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EthTx::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EthTx::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(EthTx::TimeBroadcast).timestamp())
                    .col(ColumnDef::new_with_type(EthTx::FromAddress, Address).not_null())
                    .col(ColumnDef::new_with_type(EthTx::ToAddress, Address).not_null())
                    .col(ColumnDef::new_with_type(EthTx::EncodedPayload, Bytes).not_null())
                    .col(
                        ColumnDef::new(EthTx::Value)
                            .string_len(SIGNIFICANT_DIGITS_IN_256_BIT_INTEGER)
                            .not_null(),
                    )
                    .col(ColumnDef::new(EthTx::GasLimit).big_integer().not_null())
                    .col(ColumnDef::new(EthTx::Nonce).big_integer())
                    .col(ColumnDef::new(EthTx::State).string_len(16).not_null())
                    .col(ColumnDef::new(EthTx::Error).text())
                    .col(ColumnDef::new(EthTx::PipelineTaskRunId).uuid())
                    .col(ColumnDef::new(EthTx::MinConfirmations).big_integer())
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(EthTx::Table)
                    .name("eth_tx_from_address_state_idx")
                    .col(EthTx::FromAddress)
                    .col(EthTx::State)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(EthTx::Table)
                    .name("eth_tx_from_address_nonce_idx")
                    .col(EthTx::FromAddress)
                    .col(EthTx::Nonce)
                    .unique()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EthTx::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum EthTx {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Time of the first successful broadcast
    TimeBroadcast,
    /// Sending address
    FromAddress,
    /// Recipient
    ToAddress,
    /// Calldata
    EncodedPayload,
    /// Value in wei, base-10
    Value,
    /// Gas limit
    GasLimit,
    /// Nonce, assigned once when the transaction leaves the queue
    Nonce,
    /// unstarted, in_progress, unconfirmed, confirmed or fatal_error
    State,
    /// Reason for a fatal error
    Error,
    /// Suspended pipeline task waiting on this transaction
    PipelineTaskRunId,
    /// Confirmation override for this transaction
    MinConfirmations,
}
