use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use derive_new::new;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use ::jobs::{CreatedJob, JobSpec, Spawner, WebhookDelegate};
use oracle_base::server::utils::{ServerResult, ServerSuccessResponse};
use pipeline::PipelineRun;

use super::{bad_request, job_error, Empty};

#[derive(Clone, Debug, new)]
pub struct ServerState {
    spawner: Spawner,
    webhook: Arc<WebhookDelegate>,
}

impl ServerState {
    pub fn router(self) -> Router {
        Router::new()
            .route("/jobs", post(create_job).get(list_jobs))
            .route("/jobs/{id}", get(get_job).delete(delete_job))
            .route("/jobs/{id}/runs", post(run_webhook_job))
            .route("/replay_from_block/{number}", post(replay_from_block))
            .with_state(self)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateJobBody {
    /// TOML job spec
    pub toml: String,
}

/// Create a job from its TOML spec. For webhook jobs the response carries
/// the token callers must present; it is not retrievable later.
///
/// Example request
/// ```json
/// { "toml": "type = \"cron\"\nschemaVersion = 1\nschedule = \"CRON_TZ=UTC 0 0 * * * *\"\nobservationSource = \"a [type=any];\"" }
/// ```
async fn create_job(
    State(state): State<ServerState>,
    Json(body): Json<CreateJobBody>,
) -> ServerResult<ServerSuccessResponse<CreatedJob>> {
    let created = state
        .spawner
        .create_job(&body.toml)
        .await
        .map_err(job_error)?;
    Ok(ServerSuccessResponse::new(created))
}

async fn list_jobs(
    State(state): State<ServerState>,
) -> ServerResult<ServerSuccessResponse<Vec<JobSpec>>> {
    let jobs = state.spawner.list_jobs().await.map_err(job_error)?;
    Ok(ServerSuccessResponse::new(jobs))
}

async fn get_job(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
) -> ServerResult<ServerSuccessResponse<JobSpec>> {
    let job = state.spawner.get_job(id).await.map_err(job_error)?;
    Ok(ServerSuccessResponse::new(job))
}

/// Stops the job and waits a bounded time for its running runs before
/// answering.
async fn delete_job(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
) -> ServerResult<ServerSuccessResponse<Empty>> {
    state.spawner.delete_job(id).await.map_err(job_error)?;
    Ok(ServerSuccessResponse::new(Empty {}))
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WebhookQuery {
    /// JSON object exposed to the run as `$(jobRun.meta)`
    pub meta: Option<String>,
}

/// Start a run of a webhook job. The raw request body is exposed to the
/// pipeline as `$(jobRun.requestBody)`.
async fn run_webhook_job(
    State(state): State<ServerState>,
    Path(external_job_id): Path<Uuid>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: String,
) -> ServerResult<ServerSuccessResponse<PipelineRun>> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let meta = match query.meta {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|err| bad_request(format!("invalid meta: {err}")))?,
        None => Value::Object(Default::default()),
    };
    let run = state
        .webhook
        .run_webhook_job(external_job_id, token, body, meta)
        .await
        .map_err(job_error)?;
    Ok(ServerSuccessResponse::new(run))
}

/// Have every job look for triggers again from block `number` on.
async fn replay_from_block(
    State(state): State<ServerState>,
    Path(number): Path<u64>,
) -> ServerResult<ServerSuccessResponse<Empty>> {
    tracing::info!(number, "Replaying from block");
    state
        .spawner
        .replay_from_block(number)
        .await
        .map_err(job_error)?;
    Ok(ServerSuccessResponse::new(Empty {}))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::test_utils::{body_json, eventually, TestNode};

    const CRON: &str = "type = \"cron\"\nschemaVersion = 1\nname = \"hourly\"\nschedule = \"CRON_TZ=UTC 0 0 * * * *\"\nobservationSource = \"a [type=any];\"";

    const WEBHOOK: &str = "type = \"webhook\"\nschemaVersion = 1\nobservationSource = \"\"\"\nparse [type=jsonparse data=\"$(jobRun.requestBody)\" path=\"answer\"];\n\"\"\"";

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_job_lifecycle() {
        let node = TestNode::new().await;

        let response = node
            .send(Method::POST, "/v2/jobs", Some(json!({ "toml": CRON })))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let id = created["data"]["job"]["id"].as_i64().unwrap();
        assert_eq!(created["data"]["job"]["name"], json!("hourly"));
        assert!(created["data"].get("webhookToken").is_none());

        let response = node.send(Method::GET, "/v2/jobs", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);
        assert_eq!(listed["data"][0]["id"], json!(id));

        let response = node.send(Method::GET, &format!("/v2/jobs/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = node
            .send(Method::DELETE, &format!("/v2/jobs/{id}"), None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = node.send(Method::GET, &format!("/v2/jobs/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = node
            .send(Method::DELETE, &format!("/v2/jobs/{id}"), None)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_job_is_a_bad_request() {
        let node = TestNode::new().await;
        let response = node
            .send(
                Method::POST,
                "/v2/jobs",
                Some(json!({ "toml": "type = \"cron\"\nschemaVersion = 1" })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["message"].as_str().is_some());
        assert!(node.spawner.list_jobs().await.unwrap().is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_webhook_run_requires_token() {
        let node = TestNode::new().await;
        let created = body_json(
            node.send(Method::POST, "/v2/jobs", Some(json!({ "toml": WEBHOOK })))
                .await,
        )
        .await;
        let external_id = created["data"]["job"]["externalJobID"]
            .as_str()
            .unwrap()
            .to_owned();
        let token = created["data"]["webhookToken"].as_str().unwrap().to_owned();
        let uri = format!("/v2/jobs/{external_id}/runs");

        let response = node.send(Method::POST, &uri, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = node
            .send_with(Method::POST, &uri, None, Some("not-the-token"))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = node
            .send_with(
                Method::POST,
                &format!("/v2/jobs/{}/runs", uuid::Uuid::new_v4()),
                None,
                Some(&token),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = node
            .send_with(Method::POST, &uri, Some(json!({ "answer": 1234 })), Some(&token))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let run_id = body_json(response).await["data"]["id"].as_i64().unwrap();

        let node = &node;
        let run = eventually(move || async move {
            let run = node.runner.get_run(run_id).await.unwrap();
            run.run.state.is_final().then_some(run)
        })
        .await;
        assert_eq!(run.run.outputs, Some(json!([1234])));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_replay_from_block() {
        let node = TestNode::new().await;
        let response = node.send(Method::POST, "/v2/replay_from_block/3", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = node
            .send(Method::POST, "/v2/replay_from_block/latest", None)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        node.shutdown().await;
    }
}
