use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::validator::ValidationError;

/// Error type for the HTTP handlers.
///
/// Renders as `{"error": "<message>"}` with the matching status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400 - The request body lacks a command.
    #[error("Comando requerido")]
    CommandRequired,
    /// 400 - The command was refused by the validator.
    #[error(transparent)]
    CommandRejected(#[from] ValidationError),
    /// 400 - The body is not a JSON object of the expected shape.
    #[error("Solicitud inválida: {0}")]
    InvalidRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::CommandRequired
            | ApiError::CommandRejected(_)
            | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}
