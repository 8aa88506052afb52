#![allow(clippy::enum_variant_names)]
#![allow(missing_docs)]

pub use sea_orm_migration::prelude::*;

mod l20240610_types;
mod m20240610_000001_create_table_head;
mod m20240610_000002_create_table_key_state;
mod m20240610_000003_create_table_pipeline_spec;
mod m20240610_000004_create_table_job_spec;
mod m20240610_000005_create_table_pipeline_run;
mod m20240610_000006_create_table_task_run;
mod m20240610_000007_create_table_eth_tx;
mod m20240610_000008_create_table_eth_tx_attempt;
mod m20240610_000009_create_table_eth_receipt;
mod m20240610_000010_create_table_bridge;
mod m20240610_000011_create_table_log_broadcast;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240610_000001_create_table_head::Migration),
            Box::new(m20240610_000002_create_table_key_state::Migration),
            Box::new(m20240610_000003_create_table_pipeline_spec::Migration),
            Box::new(m20240610_000004_create_table_job_spec::Migration),
            Box::new(m20240610_000005_create_table_pipeline_run::Migration),
            Box::new(m20240610_000006_create_table_task_run::Migration),
            Box::new(m20240610_000007_create_table_eth_tx::Migration),
            Box::new(m20240610_000008_create_table_eth_tx_attempt::Migration),
            Box::new(m20240610_000009_create_table_eth_receipt::Migration),
            Box::new(m20240610_000010_create_table_bridge::Migration),
            Box::new(m20240610_000011_create_table_log_broadcast::Migration),
        ]
    }
}

#[cfg(test)]
mod tests {
    use sea_orm_migration::sea_orm::{ConnectOptions, Database};

    use super::*;

    #[tokio::test]
    async fn migrations_apply_and_revert_on_sqlite() {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options).await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let manager = SchemaManager::new(&db);
        for table in [
            "head",
            "key_state",
            "pipeline_spec",
            "job_spec",
            "pipeline_run",
            "task_run",
            "eth_tx",
            "eth_tx_attempt",
            "eth_receipt",
            "bridge",
            "log_broadcast",
        ] {
            assert!(manager.has_table(table).await.unwrap(), "missing {table}");
        }
        Migrator::down(&db, None).await.unwrap();
        assert!(!manager.has_table("eth_tx").await.unwrap());
    }
}
