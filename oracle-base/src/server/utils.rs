use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use derive_new::new;
use serde::{Deserialize, Serialize};

/// Result returned by route handlers
pub type ServerResult<T> = Result<T, ServerErrorResponse>;

/// A successful response, serialized as `{"data": ...}`
#[derive(Clone, Debug, new, Deserialize, Serialize)]
pub struct ServerSuccessResponse<T> {
    /// Response payload
    pub data: T,
}

impl<T: Serialize> IntoResponse for ServerSuccessResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Body of an error response
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerErrorBody {
    /// Human readable error
    pub message: String,
}

/// An error response with its status code
#[derive(Clone, Debug, new)]
pub struct ServerErrorResponse {
    /// HTTP status
    pub status_code: StatusCode,
    /// Body
    pub body: ServerErrorBody,
}

impl ServerErrorResponse {
    /// Shorthand for an error with a message
    pub fn with_message(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self::new(
            status_code,
            ServerErrorBody {
                message: message.into(),
            },
        )
    }
}

impl IntoResponse for ServerErrorResponse {
    fn into_response(self) -> Response {
        (self.status_code, Json(self.body)).into_response()
    }
}
