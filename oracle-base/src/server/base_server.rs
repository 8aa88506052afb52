use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use derive_new::new;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::CoreMetrics;

/// A server that serves the node's routes
#[derive(new, Debug)]
pub struct Server {
    listen_port: u16,
    core_metrics: Arc<CoreMetrics>,
}

impl Server {
    /// Run an HTTP server serving only `/metrics`
    pub fn run(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        self.run_with_custom_router(Router::new(), shutdown)
    }

    /// Run an HTTP server serving node specific routes
    ///
    /// routes:
    ///  - metrics - serving OpenMetrics format reports on `/metrics`
    ///     (this is compatible with Prometheus, which ought to be configured to scrape this endpoint)
    ///  - custom_routes - the control surface
    pub fn run_with_custom_router(
        self: Arc<Self>,
        router: Router,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let port = self.listen_port;
        tracing::info!(port, "starting server on 0.0.0.0");

        let core_metrics_clone = self.core_metrics.clone();

        let app = Router::new()
            .route(
                "/metrics",
                get(move || Self::gather_metrics(core_metrics_clone)),
            )
            .merge(router);

        tokio::spawn(async move {
            let url = format!("0.0.0.0:{}", port);
            let listener = match tokio::net::TcpListener::bind(&url).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(?err, url, "Failed to bind to TCP port");
                    shutdown.cancel();
                    return;
                }
            };
            let graceful = shutdown.clone();
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
            {
                tracing::error!(?err, "Server exited with error");
                shutdown.cancel();
            }
        })
    }

    /// Gather available metrics into an encoded (plaintext, OpenMetrics format)
    /// report.
    async fn gather_metrics(core_metrics: Arc<CoreMetrics>) -> impl IntoResponse {
        tracing::debug!("Traversing route for /metrics endpoint for serving Prometheus metrics");
        match core_metrics.gather() {
            Ok(metrics) => {
                let metrics = match String::from_utf8(metrics) {
                    Ok(metrics_string) => metrics_string,
                    Err(_) => {
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal Server Error".into(),
                        )
                    }
                };
                (StatusCode::OK, metrics)
            }
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to gather metrics".into(),
            ),
        }
    }
}
