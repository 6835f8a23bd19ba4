//! API error type and its HTTP mapping

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use conductor_workflow::WorkflowError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        let err = match self {
            ApiError::BadRequest(_) => return (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Workflow(err) => err,
        };

        match err {
            WorkflowError::TemplateNotFound(_) => (StatusCode::NOT_FOUND, "TEMPLATE_NOT_FOUND"),
            WorkflowError::RunNotFound(_) => (StatusCode::NOT_FOUND, "RUN_NOT_FOUND"),
            WorkflowError::ApprovalNotFound(_) => (StatusCode::NOT_FOUND, "APPROVAL_NOT_FOUND"),
            WorkflowError::InvalidContext(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_CONTEXT"),
            WorkflowError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            WorkflowError::InvalidTemplate(_) | WorkflowError::DagValidation(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_TEMPLATE")
            }
            WorkflowError::TemplateRender { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "TEMPLATE_RENDER_ERROR")
            }
            WorkflowError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
            WorkflowError::TemplateConflict { .. } => (StatusCode::CONFLICT, "TEMPLATE_CONFLICT"),
            WorkflowError::LockContention { .. } => (StatusCode::CONFLICT, "LOCK_CONTENTION"),
            WorkflowError::Cancelled(_) => (StatusCode::CONFLICT, "CANCELLED"),
            WorkflowError::ApprovalRejected(_) => (StatusCode::FORBIDDEN, "APPROVAL_REJECTED"),
            WorkflowError::ExpiredApproval(_) => (StatusCode::GONE, "APPROVAL_EXPIRED"),
            WorkflowError::Storage(_)
            | WorkflowError::Serialization(_)
            | WorkflowError::Yaml(_)
            | WorkflowError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_workflow::RunStatus;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (WorkflowError::TemplateNotFound("x".into()), StatusCode::NOT_FOUND),
            (WorkflowError::InvalidContext("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (WorkflowError::Validation("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                WorkflowError::InvalidState {
                    run_id: "r".into(),
                    status: RunStatus::Completed,
                    expected: "waiting".into(),
                },
                StatusCode::CONFLICT,
            ),
            (WorkflowError::ApprovalRejected("x".into()), StatusCode::FORBIDDEN),
            (WorkflowError::ExpiredApproval("x".into()), StatusCode::GONE),
            (WorkflowError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_and_code().0, expected);
        }
    }

    #[test]
    fn test_bad_request() {
        let (status, code) = ApiError::BadRequest("nope".into()).status_and_code();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "BAD_REQUEST");
    }
}
