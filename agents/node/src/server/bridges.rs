use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use derive_new::new;

use oracle_base::server::utils::{ServerErrorResponse, ServerResult, ServerSuccessResponse};
use pipeline::{create_bridge, Bridge, BridgeStore, CreatedBridge, NewBridge, PipelineError};

use super::{pipeline_error, Empty};

#[derive(Clone, Debug, new)]
pub struct ServerState {
    store: Arc<dyn BridgeStore>,
}

impl ServerState {
    pub fn router(self) -> Router {
        Router::new()
            .route("/bridge_types", get(list_bridges).post(add_bridge))
            .route("/bridge_types/{name}", get(get_bridge).delete(delete_bridge))
            .with_state(self)
    }
}

fn db_error(err: impl Into<PipelineError>) -> ServerErrorResponse {
    pipeline_error(err.into())
}

fn not_found(name: &str) -> ServerErrorResponse {
    ServerErrorResponse::with_message(StatusCode::NOT_FOUND, format!("bridge {name:?}"))
}

/// Register an external adapter under a unique name. The response carries
/// the tokens exchanged with the adapter; they are shown only once.
///
/// Example request
/// ```json
/// { "name": "coingecko", "url": "https://adapter.example/price", "confirmations": 0 }
/// ```
async fn add_bridge(
    State(state): State<ServerState>,
    Json(body): Json<NewBridge>,
) -> ServerResult<ServerSuccessResponse<CreatedBridge>> {
    let created = create_bridge(state.store.as_ref(), &body)
        .await
        .map_err(pipeline_error)?;
    tracing::info!(name = %created.bridge.name, "Created bridge");
    Ok(ServerSuccessResponse::new(created))
}

async fn list_bridges(
    State(state): State<ServerState>,
) -> ServerResult<ServerSuccessResponse<Vec<Bridge>>> {
    let bridges = state.store.bridges().await.map_err(db_error)?;
    Ok(ServerSuccessResponse::new(bridges))
}

async fn get_bridge(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> ServerResult<ServerSuccessResponse<Bridge>> {
    let bridge = state
        .store
        .bridge(&name)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found(&name))?;
    Ok(ServerSuccessResponse::new(bridge))
}

async fn delete_bridge(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> ServerResult<ServerSuccessResponse<Empty>> {
    if !state.store.delete_bridge(&name).await.map_err(db_error)? {
        return Err(not_found(&name));
    }
    tracing::info!(name, "Deleted bridge");
    Ok(ServerSuccessResponse::new(Empty {}))
}
