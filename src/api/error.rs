use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::pipeline::runtime::PipelineRuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Provider,
    Infra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    pub error_kind: ErrorKind,
    pub error_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        kind: ErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            body: ErrorResponse {
                ok: false,
                error: message.into(),
                error_kind: kind,
                error_code: code.into(),
            },
        }
    }

    /// Missing or malformed form input; mirrors the usual 422 for form validation.
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Validation,
            "validation_error",
            message,
        )
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::Validation, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let detail = message.into();
        error!(detail = %detail, "internal api error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Infra,
            "internal_error",
            detail,
        )
    }
}

impl From<PipelineRuntimeError> for ApiError {
    fn from(error: PipelineRuntimeError) -> Self {
        let message = error.to_string();
        match error {
            PipelineRuntimeError::Interpreter(_) | PipelineRuntimeError::Inpaint(_) => {
                error!(detail = %message, "edit pipeline failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Provider,
                    "pipeline_error",
                    message,
                )
            }
            PipelineRuntimeError::Image(_) | PipelineRuntimeError::Setup(_) => {
                Self::internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
