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
                    .table(Bridge::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Bridge::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Bridge::TimeCreated).timestamp().not_null())
                    .col(
                        ColumnDef::new(Bridge::Name)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Bridge::Url).text().not_null())
                    .col(ColumnDef::new(Bridge::OutgoingToken).text().not_null())
                    .col(ColumnDef::new(Bridge::IncomingTokenHash).string_len(64).not_null())
                    .col(ColumnDef::new(Bridge::Confirmations).big_integer().not_null())
                    .col(
                        ColumnDef::new(Bridge::MinimumContractPayment)
                            .string_len(SIGNIFICANT_DIGITS_IN_256_BIT_INTEGER)
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Bridge::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum Bridge {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Name referenced by bridge tasks
    Name,
    /// External adapter endpoint
    Url,
    /// Token the node presents to the adapter
    OutgoingToken,
    /// SHA3-256 hex of the token the adapter presents to the node
    IncomingTokenHash,
    /// Confirmations required before calling the adapter
    Confirmations,
    /// Minimum payment in wei, base-10
    MinimumContractPayment,
}
