// ABOUTME: API error type mapping reconciler and upload failures to HTTP responses
// ABOUTME: Every error body is JSON with a message, a machine-readable code and context when known

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dockformer_manifest::ParseError;
use dockformer_reconciler::{ActionKind, ApplySummary, ReconcileError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

/// Main application error type that all handlers return
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed request that never reached the parser (missing field, bad extension)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Too many log streams open from this client")]
    TooManyStreams,

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl From<ParseError> for AppError {
    fn from(err: ParseError) -> Self {
        Self::Reconcile(ReconcileError::Parse(err))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<ActionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ApplySummary>,
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::TooManyStreams => (StatusCode::TOO_MANY_REQUESTS, "STREAM_LIMIT_EXCEEDED"),
            AppError::Reconcile(err) => match err {
                ReconcileError::Parse(ParseError::Syntax(_)) => {
                    (StatusCode::BAD_REQUEST, "PARSE_ERROR")
                }
                ReconcileError::Parse(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                ReconcileError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ReconcileError::NoManifest => (StatusCode::NOT_FOUND, "NO_MANIFEST"),
                ReconcileError::RuntimeUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "RUNTIME_UNAVAILABLE")
                }
                ReconcileError::Runtime { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "RUNTIME_ERROR")
                }
                ReconcileError::PartialApply(_) => (StatusCode::MULTI_STATUS, "PARTIAL_APPLY"),
                ReconcileError::Storage(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
                }
            },
        }
    }

    fn body(&self) -> ErrorBody {
        let (_, code) = self.to_status_and_code();
        let mut body = ErrorBody {
            error: self.to_string(),
            code,
            container: None,
            action: None,
            field: None,
            summary: None,
        };

        if let AppError::Reconcile(err) = self {
            body.container = err.container().map(str::to_string);
            body.action = err.action();
            match err {
                ReconcileError::Parse(parse) => body.field = parse.field().map(str::to_string),
                ReconcileError::PartialApply(summary) => body.summary = Some(summary.clone()),
                // Keep store internals out of responses
                ReconcileError::Storage(_) => body.error = "Manifest storage error".to_string(),
                _ => {}
            }
        }
        body
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.to_status_and_code();

        if status.is_server_error() {
            error!(error_code = code, error = %self, "API error response");
        } else {
            info!(error_code = code, error = %self, "API error response");
        }

        (status, Json(self.body())).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use dockformer_manifest::ValidationReason;
    use dockformer_runtime::RuntimeError;

    #[test]
    fn test_parse_errors_are_bad_requests() {
        let syntax = AppError::from(ParseError::Syntax("bad indent".to_string()));
        assert_eq!(
            syntax.to_status_and_code(),
            (StatusCode::BAD_REQUEST, "PARSE_ERROR")
        );

        let duplicate = AppError::from(
            ParseError::validation("name", ValidationReason::Duplicate).in_container("cache"),
        );
        assert_eq!(
            duplicate.to_status_and_code(),
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
        );
        let body = duplicate.body();
        assert_eq!(body.field.as_deref(), Some("name"));
        assert_eq!(body.container.as_deref(), Some("cache"));
    }

    #[test]
    fn test_runtime_errors_carry_context() {
        let err = AppError::from(ReconcileError::runtime(
            "web",
            ActionKind::Restart,
            RuntimeError::Operation("boom".to_string()),
        ));
        assert_eq!(
            err.to_status_and_code(),
            (StatusCode::INTERNAL_SERVER_ERROR, "RUNTIME_ERROR")
        );
        let body = err.body();
        assert_eq!(body.container.as_deref(), Some("web"));
        assert_eq!(body.action, Some(ActionKind::Restart));
        assert!(body.error.contains("boom"));
    }

    #[test]
    fn test_unavailable_and_not_found() {
        let unavailable = AppError::from(ReconcileError::RuntimeUnavailable("down".to_string()));
        assert_eq!(unavailable.to_status_and_code().0, StatusCode::SERVICE_UNAVAILABLE);

        let missing = AppError::from(ReconcileError::NotFound("ghost".to_string()));
        assert_eq!(missing.to_status_and_code().0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_partial_apply_includes_summary() {
        let mut summary = ApplySummary::new(3);
        summary.created.push("web".to_string());
        let err = AppError::from(ReconcileError::PartialApply(summary));
        assert_eq!(err.to_status_and_code().0, StatusCode::MULTI_STATUS);
        assert_eq!(err.body().summary.unwrap().generation, 3);
    }
}
