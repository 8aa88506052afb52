use std::sync::Arc;

use axum::{http::StatusCode, Router};
use derive_new::new;
use serde::{Deserialize, Serialize};

use headtracker::HeadTracker;
use ::jobs::{JobError, Spawner, WebhookDelegate};
use oracle_base::server::utils::ServerErrorResponse;
use pipeline::{BridgeStore, PipelineError, PipelineRunner};
use txm::{TxManager, TxmError};

pub mod bridges;
pub mod heads;
pub mod jobs;
pub mod keys;
pub mod runs;
pub mod txs;

/// Prefix of every control surface route
pub const API_PREFIX: &str = "/v2";

const DEFAULT_PAGE_SIZE: u64 = 25;
const MAX_PAGE_SIZE: u64 = 1000;

/// Builds the control surface.
#[derive(new)]
pub struct Server {
    spawner: Spawner,
    webhook: Arc<WebhookDelegate>,
    runner: PipelineRunner,
    txm: TxManager,
    bridges: Arc<dyn BridgeStore>,
    tracker: Arc<HeadTracker>,
}

impl Server {
    /// Every route, nested under [`API_PREFIX`].
    pub fn router(self) -> Router {
        let api = Router::new()
            .merge(jobs::ServerState::new(self.spawner, self.webhook).router())
            .merge(runs::ServerState::new(self.runner).router())
            .merge(txs::ServerState::new(self.txm.clone()).router())
            .merge(keys::ServerState::new(self.txm).router())
            .merge(bridges::ServerState::new(self.bridges).router())
            .merge(heads::ServerState::new(self.tracker).router());
        Router::new().nest(API_PREFIX, api)
    }
}

/// Body of responses carrying no data.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Empty {}

/// `?offset=&limit=` of list routes.
#[derive(Clone, Copy, Debug, Default, Deserialize, new)]
pub struct Page {
    offset: Option<u64>,
    limit: Option<u64>,
}

impl Page {
    fn offset(&self) -> u64 {
        self.offset.unwrap_or(0)
    }

    fn limit(&self) -> u64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

fn bad_request(message: impl Into<String>) -> ServerErrorResponse {
    ServerErrorResponse::with_message(StatusCode::BAD_REQUEST, message)
}

fn internal(err: impl std::fmt::Display) -> ServerErrorResponse {
    tracing::error!(%err, "Request failed");
    ServerErrorResponse::with_message(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub(crate) fn job_error(err: JobError) -> ServerErrorResponse {
    match err {
        JobError::Unauthorized => {
            ServerErrorResponse::with_message(StatusCode::UNAUTHORIZED, err.to_string())
        }
        JobError::Draining(_) => {
            ServerErrorResponse::with_message(StatusCode::CONFLICT, err.to_string())
        }
        JobError::Pipeline(err) => pipeline_error(err),
        err if err.is_not_found() => {
            ServerErrorResponse::with_message(StatusCode::NOT_FOUND, err.to_string())
        }
        err if err.is_validation() => bad_request(err.to_string()),
        err => internal(err),
    }
}

pub(crate) fn pipeline_error(err: PipelineError) -> ServerErrorResponse {
    match err {
        PipelineError::NotFound(_) => {
            ServerErrorResponse::with_message(StatusCode::NOT_FOUND, err.to_string())
        }
        err if err.is_validation() => bad_request(err.to_string()),
        err => internal(err),
    }
}

pub(crate) fn txm_error(err: TxmError) -> ServerErrorResponse {
    match err {
        TxmError::QueueFull { .. } => {
            ServerErrorResponse::with_message(StatusCode::TOO_MANY_REQUESTS, err.to_string())
        }
        TxmError::NotFound(_) => {
            ServerErrorResponse::with_message(StatusCode::NOT_FOUND, err.to_string())
        }
        TxmError::Validation(_) => bad_request(err.to_string()),
        err => internal(err),
    }
}
