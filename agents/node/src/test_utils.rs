use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Method, Request, Response},
    Router,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use headtracker::{HeadBroadcaster, HeadTracker, HeadTrackerConfig, HeadTrackerMetrics};
use jobs::{
    CronDelegate, Delegate, DirectRequestDelegate, JobMetrics, JobStore, JobsConfig, Spawner,
    WebhookDelegate,
};
use oracle_base::db::OracleDb;
use oracle_test::{test_key_store, SimulatedChain};
use pipeline::{PipelineMetrics, PipelineRunner, RunnerConfig, TaskEnv};
use txm::{TxManager, TxmConfig, TxmMetrics};

use crate::server::Server;

pub const CHAIN_ID: u64 = 1337;
const FINALITY_DEPTH: u64 = 5;

/// Every subsystem of the node over an in-memory database and a simulated
/// chain, with the control surface router in front.
pub struct TestNode {
    pub db: OracleDb,
    pub chain: Arc<SimulatedChain>,
    pub runner: PipelineRunner,
    pub txm: TxManager,
    pub spawner: Spawner,
    pub app: Router,
    broadcaster: HeadBroadcaster,
    cancel: CancellationToken,
}

impl TestNode {
    pub async fn new() -> Self {
        let db = OracleDb::in_memory().await.unwrap();
        let chain = Arc::new(SimulatedChain::with_height(CHAIN_ID, 10));
        let keys = Arc::new(test_key_store(1));

        let broadcaster =
            HeadBroadcaster::new(Duration::from_secs(2), HeadTrackerMetrics::dummy_instance());
        let tracker = Arc::new(HeadTracker::new(
            chain.clone(),
            Arc::new(db.clone()),
            broadcaster.clone(),
            HeadTrackerConfig {
                finality_depth: FINALITY_DEPTH,
                retry_backoff: Duration::from_millis(10),
                ..Default::default()
            },
            HeadTrackerMetrics::dummy_instance(),
        ));

        let txm = TxManager::new(
            Arc::new(db.clone()),
            chain.clone(),
            keys,
            TxmConfig {
                chain_id: CHAIN_ID,
                finality_depth: FINALITY_DEPTH,
                min_confirmations: 2,
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            TxmMetrics::dummy_instance(),
            tracker.health(),
        );
        let env = TaskEnv::new(
            Arc::new(db.clone()),
            chain.clone(),
            Arc::new(txm.clone()),
            RunnerConfig::default(),
        );
        let runner = PipelineRunner::new(
            Arc::new(db.clone()),
            env,
            PipelineMetrics::dummy_instance(),
        );
        txm.set_resume_callback(Arc::new(runner.clone()));

        let config = JobsConfig {
            finality_depth: FINALITY_DEPTH,
            trigger_fallback_db_poll_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(1),
            resubscribe_backoff: Duration::from_millis(10),
        };
        let metrics = JobMetrics::dummy_instance();
        let store: Arc<dyn JobStore> = Arc::new(db.clone());
        let webhook = Arc::new(WebhookDelegate::new(
            runner.clone(),
            store.clone(),
            metrics.clone(),
        ));
        let delegates: Vec<Arc<dyn Delegate>> = vec![
            Arc::new(CronDelegate::new(runner.clone(), metrics.clone())),
            Arc::new(DirectRequestDelegate::new(
                chain.clone(),
                store.clone(),
                runner.clone(),
                broadcaster.clone(),
                config.clone(),
                metrics.clone(),
            )),
            webhook.clone(),
        ];
        let spawner = Spawner::new(store, runner.clone(), delegates, config, metrics);

        let cancel = CancellationToken::new();
        broadcaster.start();
        tracker.start(cancel.clone()).await.unwrap();
        txm.start(cancel.clone()).await.unwrap();
        spawner.start(cancel.clone()).await.unwrap();

        let app = Server::new(
            spawner.clone(),
            webhook,
            runner.clone(),
            txm.clone(),
            Arc::new(db.clone()),
            tracker,
        )
        .router();

        Self {
            db,
            chain,
            runner,
            txm,
            spawner,
            app,
            broadcaster,
            cancel,
        }
    }

    pub async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
        self.send_with(method, uri, body, None).await
    }

    pub async fn send_with(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> Response<Body> {
        let mut request = Request::builder().uri(uri).method(method);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("Failed to build request");
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request")
    }

    pub async fn shutdown(&self) {
        self.spawner.close().await;
        self.cancel.cancel();
        self.broadcaster.close();
    }
}

/// The parsed JSON body of `response`.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Polls `check` until it yields a value, failing after five seconds.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    unreachable!("condition not met in time");
}
