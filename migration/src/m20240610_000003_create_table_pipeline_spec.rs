use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PipelineSpec::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PipelineSpec::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PipelineSpec::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(PipelineSpec::DotDagSource).text().not_null())
                    .col(ColumnDef::new(PipelineSpec::MaxTaskDurationMs).big_integer())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PipelineSpec::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum PipelineSpec {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Pipeline source text
    DotDagSource,
    /// Per-task timeout override in milliseconds
    MaxTaskDurationMs,
}
