use std::str::FromStr;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use derive_new::new;
use serde::{Deserialize, Serialize};

use oracle_base::{
    server::utils::{ServerErrorResponse, ServerResult, ServerSuccessResponse},
    settings::parse_wei,
};
use oracle_core::{Address, H256};
use txm::{KeyState, TxManager};

use super::{bad_request, txm_error, Empty};

#[derive(Clone, Debug, new)]
pub struct ServerState {
    txm: TxManager,
}

impl ServerState {
    pub fn router(self) -> Router {
        Router::new()
            .route("/keys/eth", get(list_keys))
            .route("/keys/eth/{address}/nonce", post(reset_nonce))
            .route("/keys/eth/{address}/disabled", post(set_disabled))
            .route("/keys/eth/{address}/rebroadcast", post(rebroadcast))
            .with_state(self)
    }
}

fn parse_address(raw: &str) -> Result<Address, ServerErrorResponse> {
    Address::from_str(raw).map_err(|err| bad_request(format!("invalid address: {err}")))
}

async fn list_keys(
    State(state): State<ServerState>,
) -> ServerResult<ServerSuccessResponse<Vec<KeyState>>> {
    let keys = state.txm.list_keys().await.map_err(txm_error)?;
    Ok(ServerSuccessResponse::new(keys))
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResetNonceBody {
    pub nonce: u64,
}

/// Overwrite the next nonce of a key. Only for recovering from a nonce gap
/// or a key used outside the node.
async fn reset_nonce(
    State(state): State<ServerState>,
    Path(address): Path<String>,
    Json(body): Json<ResetNonceBody>,
) -> ServerResult<ServerSuccessResponse<Empty>> {
    let address = parse_address(&address)?;
    state
        .txm
        .reset_nonce(address, body.nonce)
        .await
        .map_err(txm_error)?;
    Ok(ServerSuccessResponse::new(Empty {}))
}

#[derive(Clone, Debug, Deserialize)]
pub struct SetDisabledBody {
    pub disabled: bool,
}

async fn set_disabled(
    State(state): State<ServerState>,
    Path(address): Path<String>,
    Json(body): Json<SetDisabledBody>,
) -> ServerResult<ServerSuccessResponse<Empty>> {
    let address = parse_address(&address)?;
    state
        .txm
        .set_key_disabled(address, body.disabled)
        .await
        .map_err(txm_error)?;
    Ok(ServerSuccessResponse::new(Empty {}))
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebroadcastBody {
    pub begin_nonce: u64,
    pub end_nonce: u64,
    /// Wei, decimal
    pub gas_price_wei: String,
    pub gas_limit: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RebroadcastResult {
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Re-sign and send whatever the key holds at each nonce of the inclusive
/// range, or an empty self transfer where it holds nothing.
///
/// Example request
/// ```json
/// { "beginNonce": 4, "endNonce": 6, "gasPriceWei": "50000000000", "gasLimit": 21000 }
/// ```
async fn rebroadcast(
    State(state): State<ServerState>,
    Path(address): Path<String>,
    Json(body): Json<RebroadcastBody>,
) -> ServerResult<ServerSuccessResponse<Vec<RebroadcastResult>>> {
    let address = parse_address(&address)?;
    let gas_price = parse_wei(&body.gas_price_wei)
        .map_err(|err| bad_request(format!("invalid gasPriceWei: {err}")))?;
    let results = state
        .txm
        .force_rebroadcast(body.begin_nonce..=body.end_nonce, address, gas_price, body.gas_limit)
        .await
        .map_err(txm_error)?
        .into_iter()
        .map(|(nonce, outcome)| match outcome {
            Ok(hash) => RebroadcastResult {
                nonce,
                hash: Some(hash),
                error: None,
            },
            Err(error) => RebroadcastResult {
                nonce,
                hash: None,
                error: Some(error),
            },
        })
        .collect();
    Ok(ServerSuccessResponse::new(results))
}
