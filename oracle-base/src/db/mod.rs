use std::time::Duration;

use eyre::{Context, Result};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    Statement,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::settings::DatabaseConf;

pub use conversions::*;

mod conversions;
#[allow(missing_docs)]
pub mod generated;

const CONNECT_ATTEMPTS: u32 = 5;

/// Key of the process wide advisory lock.
pub const ADVISORY_LOCK_ID: i64 = 0x6f7261636c65;

/// Handle to the node's database. Every component store is implemented on
/// this type.
#[derive(Clone, Debug)]
pub struct OracleDb(DatabaseConnection);

impl OracleDb {
    /// Connects with the configured pool size and timeouts, retrying a few
    /// times with a growing delay.
    #[instrument(skip_all)]
    pub async fn connect(conf: &DatabaseConf) -> Result<Self> {
        let mut opts = ConnectOptions::new(conf.url.clone());
        opts.max_connections(conf.max_connections)
            .connect_timeout(conf.timeout)
            .acquire_timeout(conf.timeout)
            .sqlx_logging(false);

        let mut delay = Duration::from_millis(500);
        let mut attempt = 1;
        loop {
            match Database::connect(opts.clone()).await {
                Ok(conn) => return Ok(Self(conn)),
                Err(err) if attempt < CONNECT_ATTEMPTS => {
                    warn!(?err, attempt, "Failed to connect to database, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err).context("Failed to connect to database"),
            }
        }
    }

    /// Wraps an existing connection.
    pub fn with_connection(db: DatabaseConnection) -> Self {
        Self(db)
    }

    /// Migrated SQLite database living in memory. The pool holds a single
    /// connection since every connection would otherwise see its own
    /// database.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn in_memory() -> Result<Self, DbErr> {
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1).min_connections(1).sqlx_logging(false);
        let db = Self(Database::connect(opts).await?);
        db.migrate().await?;
        Ok(db)
    }

    /// The underlying connection.
    pub fn conn(&self) -> &DatabaseConnection {
        &self.0
    }

    /// Backend of the connection.
    pub fn backend(&self) -> DatabaseBackend {
        self.0.get_database_backend()
    }

    /// Applies every pending migration.
    #[instrument(skip_all)]
    pub async fn migrate(&self) -> Result<(), DbErr> {
        Migrator::up(&self.0, None).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

/// Process wide lock preventing two nodes from managing the same keys.
///
/// On Postgres this is a session level advisory lock held on a dedicated
/// connection; other backends have nothing to lock.
#[derive(Debug)]
pub struct AdvisoryLock {
    conn: Option<DatabaseConnection>,
}

impl AdvisoryLock {
    /// Takes the lock, failing if another node holds it.
    #[instrument(skip_all)]
    pub async fn acquire(conf: &DatabaseConf) -> Result<Self> {
        if !conf.advisory_lock || !conf.url.starts_with("postgres") {
            info!("Advisory lock skipped");
            return Ok(Self { conn: None });
        }
        let mut opts = ConnectOptions::new(conf.url.clone());
        opts.max_connections(1)
            .min_connections(1)
            .connect_timeout(conf.timeout)
            .sqlx_logging(false);
        let conn = Database::connect(opts)
            .await
            .context("Failed to open advisory lock connection")?;
        let row = conn
            .query_one(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "SELECT pg_try_advisory_lock($1) AS locked",
                [ADVISORY_LOCK_ID.into()],
            ))
            .await?
            .ok_or_else(|| eyre::eyre!("pg_try_advisory_lock returned no row"))?;
        let locked: bool = row.try_get("", "locked")?;
        if !locked {
            eyre::bail!("Advisory lock {ADVISORY_LOCK_ID} is held by another node");
        }
        info!(lock_id = ADVISORY_LOCK_ID, "Advisory lock acquired");
        Ok(Self { conn: Some(conn) })
    }

    async fn still_held(conn: &DatabaseConnection) -> Result<bool, DbErr> {
        let row = conn
            .query_one(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "SELECT count(*) AS held FROM pg_locks \
                 WHERE locktype = 'advisory' AND pid = pg_backend_pid() \
                 AND ((classid::bigint << 32) | objid::bigint) = $1",
                [ADVISORY_LOCK_ID.into()],
            ))
            .await?;
        let held: i64 = match row {
            Some(row) => row.try_get("", "held")?,
            None => 0,
        };
        Ok(held > 0)
    }

    /// Checks the lock every `interval` and cancels `shutdown` when it is
    /// lost.
    pub fn keep(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(conn) = self.conn else {
                return;
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match Self::still_held(&conn).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!("Advisory lock lost, shutting down");
                        shutdown.cancel();
                        break;
                    }
                    Err(err) => {
                        tracing::error!(?err, "Advisory lock check failed, shutting down");
                        shutdown.cancel();
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::{ActiveModelTrait, ActiveValue::*, EntityTrait};

    use super::{generated::key_state, *};

    #[tokio::test]
    async fn in_memory_database_is_migrated() {
        let db = OracleDb::in_memory().await.unwrap();
        key_state::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            time_updated: Set(now()),
            address: Set(vec![1; 20]),
            next_nonce: Set(0),
            disabled: Set(false),
        }
        .insert(db.conn())
        .await
        .unwrap();
        let rows = key_state::Entity::find().all(db.conn()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(db.backend(), DatabaseBackend::Sqlite);
    }

    #[tokio::test]
    async fn advisory_lock_is_skipped_off_postgres() {
        let conf = DatabaseConf {
            url: "sqlite::memory:".into(),
            timeout: Duration::from_secs(1),
            max_connections: 1,
            maximum_tx_duration: Duration::from_secs(1),
            advisory_lock: true,
            lock_check_interval: Duration::from_millis(10),
        };
        let lock = AdvisoryLock::acquire(&conf).await.unwrap();
        let shutdown = CancellationToken::new();
        lock.keep(conf.lock_check_interval, shutdown.clone())
            .await
            .unwrap();
        assert!(!shutdown.is_cancelled());
    }
}
