use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Router,
};
use derive_new::new;
use serde::Serialize;

use oracle_base::server::utils::{ServerResult, ServerSuccessResponse};
use oracle_core::H256;
use txm::{EthTx, EthTxAttempt, TxManager};

use super::{bad_request, txm_error, Page};

#[derive(Clone, Debug, new)]
pub struct ServerState {
    txm: TxManager,
}

impl ServerState {
    pub fn router(self) -> Router {
        Router::new()
            .route("/transactions/{hash}", get(get_transaction))
            .route("/tx_attempts", get(list_attempts))
            .with_state(self)
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    #[serde(flatten)]
    pub tx: EthTx,
    pub attempts: Vec<EthTxAttempt>,
}

/// The transaction one of whose attempts has `hash`.
async fn get_transaction(
    State(state): State<ServerState>,
    Path(hash): Path<String>,
) -> ServerResult<ServerSuccessResponse<TransactionResponse>> {
    let hash =
        H256::from_str(&hash).map_err(|err| bad_request(format!("invalid hash: {err}")))?;
    let (tx, attempts) = state.txm.get_transaction(hash).await.map_err(txm_error)?;
    Ok(ServerSuccessResponse::new(TransactionResponse { tx, attempts }))
}

#[derive(Clone, Debug, Serialize)]
pub struct AttemptList {
    pub attempts: Vec<EthTxAttempt>,
    pub total: u64,
}

async fn list_attempts(
    State(state): State<ServerState>,
    Query(page): Query<Page>,
) -> ServerResult<ServerSuccessResponse<AttemptList>> {
    let (attempts, total) = state
        .txm
        .list_attempts(page.offset(), page.limit())
        .await
        .map_err(txm_error)?;
    Ok(ServerSuccessResponse::new(AttemptList { attempts, total }))
}
