use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::Router;
use eyre::{eyre, Result, WrapErr};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use headtracker::{
    HeadBroadcaster, HeadTracker, HeadTrackerMetrics, HeadTrackerResult, Unsubscriber,
};
use jobs::{
    CronDelegate, Delegate, DirectRequestDelegate, JobMetrics, JobStore, Spawner, WebhookDelegate,
};
use oracle_base::{
    chain::EthersChainClient,
    db::{AdvisoryLock, OracleDb},
    server::Server as BaseServer,
    BaseAgent, CoreMetrics, LocalKeyStore,
};
use oracle_core::{ChainClient, KeyStore};
use pipeline::{PipelineMetrics, PipelineRunner, TaskEnv};
use txm::{BalanceMonitor, TxManager, TxmMetrics};

use crate::{server::Server, settings::NodeSettings};

/// How long one head subscriber may take before the broadcaster moves on.
const HEAD_CALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

/// The oracle node: one chain, one database, every job type.
#[derive(Debug)]
pub struct OracleNode {
    tracker: Arc<HeadTracker>,
    broadcaster: HeadBroadcaster,
    txm: TxManager,
    spawner: Spawner,
    server: Arc<BaseServer>,
    router: Router,
    lock_task: JoinHandle<()>,
    subscriptions: Vec<Unsubscriber>,
    shutdown: CancellationToken,
    grace: Duration,
}

#[async_trait]
impl BaseAgent for OracleNode {
    const AGENT_NAME: &'static str = "oracle_node";

    type Settings = NodeSettings;

    async fn from_settings(
        settings: Self::Settings,
        metrics: Arc<CoreMetrics>,
        shutdown: CancellationToken,
    ) -> Result<Self>
    where
        Self: Sized,
    {
        let db = OracleDb::connect(&settings.database).await?;
        let lock_task = AdvisoryLock::acquire(&settings.database)
            .await?
            .keep(settings.database.lock_check_interval, shutdown.clone());
        db.migrate().await.context("Failed to run migrations")?;

        let chain: Arc<dyn ChainClient> =
            Arc::new(EthersChainClient::connect(&settings.chain).await?);
        let keys: Arc<dyn KeyStore> = Arc::new(
            LocalKeyStore::from_conf(&settings.keys).context("Failed to load sending keys")?,
        );

        let registry = metrics.registry();
        let head_metrics = HeadTrackerMetrics::new(&registry)?;
        let broadcaster = HeadBroadcaster::new(HEAD_CALLBACK_TIMEOUT, head_metrics.clone());
        let tracker = Arc::new(HeadTracker::new(
            chain.clone(),
            Arc::new(db.clone()),
            broadcaster.clone(),
            settings.head_tracker.clone(),
            head_metrics,
        ));

        let mut txm_config = settings.txm.clone();
        txm_config.chain_id = chain.chain_id();
        let txm = TxManager::new(
            Arc::new(db.clone()),
            chain.clone(),
            keys.clone(),
            txm_config,
            TxmMetrics::new(&registry)?,
            tracker.health(),
        );
        let subscriptions = vec![
            broadcaster.subscribe(txm.confirmer()).1,
            broadcaster
                .subscribe(Arc::new(BalanceMonitor::new(
                    chain.clone(),
                    keys,
                    &metrics,
                )))
                .1,
        ];

        let env = TaskEnv::new(
            Arc::new(db.clone()),
            chain.clone(),
            Arc::new(txm.clone()),
            settings.pipeline.clone(),
        );
        let runner = PipelineRunner::new(
            Arc::new(db.clone()),
            env,
            PipelineMetrics::new(&registry)?,
        );
        txm.set_resume_callback(Arc::new(runner.clone()));

        let job_metrics = JobMetrics::new(&registry)?;
        let job_store: Arc<dyn JobStore> = Arc::new(db.clone());
        let webhook = Arc::new(WebhookDelegate::new(
            runner.clone(),
            job_store.clone(),
            job_metrics.clone(),
        ));
        let delegates: Vec<Arc<dyn Delegate>> = vec![
            Arc::new(CronDelegate::new(runner.clone(), job_metrics.clone())),
            Arc::new(DirectRequestDelegate::new(
                chain,
                job_store.clone(),
                runner.clone(),
                broadcaster.clone(),
                settings.jobs.clone(),
                job_metrics.clone(),
            )),
            webhook.clone(),
        ];
        let spawner = Spawner::new(
            job_store,
            runner.clone(),
            delegates,
            settings.jobs.clone(),
            job_metrics,
        );

        let router = Server::new(
            spawner.clone(),
            webhook,
            runner,
            txm.clone(),
            Arc::new(db),
            tracker.clone(),
        )
        .router();
        let server = Arc::new(BaseServer::new(settings.server.port, metrics));

        Ok(Self {
            tracker,
            broadcaster,
            txm,
            spawner,
            server,
            router,
            lock_task,
            subscriptions,
            shutdown,
            grace: settings.database.maximum_tx_duration,
        })
    }

    async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let mut tasks = vec![self.lock_task, self.broadcaster.start()];

        let mut tracker_task = self.tracker.start(cancel.clone()).await?;
        tasks.extend(self.txm.start(cancel.clone()).await?);
        tasks.push(self.spawner.start(cancel.clone()).await?);
        tasks.push(
            self.server
                .run_with_custom_router(self.router, self.shutdown.clone()),
        );
        info!("Oracle node started");

        let fatal = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            res = &mut tracker_task => Some(tracker_outcome(res)),
        };
        if let Some(Err(err)) = &fatal {
            error!(?err, "Head tracker failed, shutting down");
        }
        self.shutdown.cancel();

        // jobs first, so no new run starts while the rest winds down
        self.spawner.close().await;
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        cancel.cancel();
        self.broadcaster.close();

        let stopped = async {
            if fatal.is_none() {
                let _ = tracker_task.await;
            }
            join_all(tasks).await;
        };
        if tokio::time::timeout(self.grace, stopped).await.is_err() {
            warn!(grace = ?self.grace, "Subsystems did not stop in time");
        }
        fatal.unwrap_or(Ok(()))
    }
}

fn tracker_outcome(res: Result<HeadTrackerResult<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(res) => res.map_err(Into::into),
        Err(err) => Err(eyre!("head tracker task failed: {err}")),
    }
}
