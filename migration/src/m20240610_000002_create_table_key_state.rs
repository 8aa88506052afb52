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
                    .table(KeyState::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(KeyState::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(KeyState::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(KeyState::TimeUpdated).timestamp().not_null())
                    .col(
                        ColumnDef::new_with_type(KeyState::Address, Address)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(KeyState::NextNonce).big_integer().not_null())
                    .col(
                        ColumnDef::new(KeyState::Disabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(KeyState::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum KeyState {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Time of the last nonce change
    TimeUpdated,
    /// Sending address
    Address,
    /// Nonce the next transaction from this address will use
    NextNonce,
    /// Disabled keys are never used to send
    Disabled,
}
