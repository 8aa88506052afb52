use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use derive_new::new;

use headtracker::HeadTracker;
use oracle_base::server::utils::{ServerErrorResponse, ServerResult, ServerSuccessResponse};
use oracle_core::Head;

use super::internal;

#[derive(Clone, Debug, new)]
pub struct ServerState {
    tracker: Arc<HeadTracker>,
}

impl ServerState {
    pub fn router(self) -> Router {
        Router::new()
            .route("/heads/latest", get(latest_head))
            .with_state(self)
    }
}

/// Tip of the longest chain, or the highest stored head before the
/// tracker has processed one.
async fn latest_head(
    State(state): State<ServerState>,
) -> ServerResult<ServerSuccessResponse<Head>> {
    let head = match state.tracker.latest_chain() {
        Some(head) => Some(head),
        None => state.tracker.highest_seen_head().await.map_err(internal)?,
    };
    head.map(ServerSuccessResponse::new).ok_or_else(|| {
        ServerErrorResponse::with_message(StatusCode::NOT_FOUND, "no head seen yet")
    })
}
