use axum::{
    extract::{Path, Query, State},
    routing::{get, patch},
    Json, Router,
};
use derive_new::new;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use oracle_base::server::utils::{ServerResult, ServerSuccessResponse};
use pipeline::{PipelineRun, PipelineRunner, RunState, RunWithTasks};

use super::{bad_request, pipeline_error, Page};

#[derive(Clone, Debug, new)]
pub struct ServerState {
    runner: PipelineRunner,
}

impl ServerState {
    pub fn router(self) -> Router {
        Router::new()
            .route("/pipeline/runs", get(list_runs))
            .route("/pipeline/runs/{id}", get(get_run))
            .route("/resume/{task_run_id}", patch(resume))
            .with_state(self)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    pub job_id: Option<i64>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunList {
    pub runs: Vec<PipelineRun>,
    pub total: u64,
}

/// Runs, newest first, optionally of one job.
async fn list_runs(
    State(state): State<ServerState>,
    Query(query): Query<ListRunsQuery>,
) -> ServerResult<ServerSuccessResponse<RunList>> {
    let page = Page::new(query.offset, query.limit);
    let (runs, total) = state
        .runner
        .list_runs(query.job_id, page.offset(), page.limit())
        .await
        .map_err(pipeline_error)?;
    Ok(ServerSuccessResponse::new(RunList { runs, total }))
}

async fn get_run(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
) -> ServerResult<ServerSuccessResponse<RunWithTasks>> {
    let run = state.runner.get_run(id).await.map_err(pipeline_error)?;
    Ok(ServerSuccessResponse::new(run))
}

/// Exactly one of `value` and `error`.
#[derive(Clone, Debug, Deserialize)]
pub struct ResumeBody {
    pub value: Option<Value>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResumeResponse {
    pub state: RunState,
}

/// Complete a suspended task with a value or an error and continue its
/// run.
///
/// Example request
/// ```json
/// { "value": "0x5c1e" }
/// ```
async fn resume(
    State(state): State<ServerState>,
    Path(task_run_id): Path<Uuid>,
    Json(body): Json<ResumeBody>,
) -> ServerResult<ServerSuccessResponse<ResumeResponse>> {
    let result = match body {
        ResumeBody {
            value: Some(value),
            error: None,
        } => Ok(value),
        ResumeBody {
            value: None,
            error: Some(error),
        } => Err(error),
        _ => return Err(bad_request("expected exactly one of value and error")),
    };
    let run_state = state
        .runner
        .resume_task(task_run_id, result)
        .await
        .map_err(pipeline_error)?;
    Ok(ServerSuccessResponse::new(ResumeResponse { state: run_state }))
}
