use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::PortdError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl From<PortdError> for ApiError {
    fn from(err: PortdError) -> Self {
        let (status, kind) = match &err {
            PortdError::UnsupportedSource(_) => (StatusCode::BAD_REQUEST, "unsupported_source"),
            PortdError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            PortdError::FieldNotWritable(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "field_not_writable")
            }
            PortdError::AlreadyExists { .. } => (StatusCode::CONFLICT, "already_exists"),
            PortdError::InvalidMaintainerTransition { .. } => {
                (StatusCode::CONFLICT, "invalid_maintainer_transition")
            }
            PortdError::PatchInProgress { .. } => (StatusCode::CONFLICT, "patch_in_progress"),
            PortdError::DependencyUnresolved { .. } => {
                (StatusCode::CONFLICT, "dependency_unresolved")
            }
            PortdError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            PortdError::PortNotFound(_)
            | PortdError::PatchNotFound(_)
            | PortdError::ArtifactNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            PortdError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream"),
            PortdError::Config(_)
            | PortdError::Serialization(_)
            | PortdError::Io(_)
            | PortdError::Internal(_) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
            kind: self.kind,
        });
        (self.status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
