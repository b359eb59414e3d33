use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Store timeout or contention. Nothing was committed; safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The destructive action kept failing. The request stays `approved`
    /// until an operator or a later call completes it.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        let db_error = match &err {
            sqlx::Error::RowNotFound => return AppError::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                return AppError::Transient(err.to_string())
            }
            sqlx::Error::Database(db) => {
                Some((db.code().map(|c| c.into_owned()), db.message().to_string()))
            }
            _ => None,
        };

        match db_error {
            // unique_violation
            Some((Some(code), message)) if code == "23505" => AppError::Conflict(message),
            // serialization_failure, deadlock_detected, lock_not_available, query_canceled
            Some((Some(code), message))
                if matches!(code.as_str(), "40001" | "40P01" | "55P03" | "57014") =>
            {
                AppError::Transient(message)
            }
            _ => AppError::Internal(anyhow::Error::new(err)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Unauthorized(m) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthorized",
                m.clone(),
            ),
            AppError::Forbidden(m) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "forbidden",
                m.clone(),
            ),
            AppError::NotFound(m) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "not_found",
                m.clone(),
            ),
            AppError::Conflict(m) => (
                StatusCode::CONFLICT,
                "conflict_error",
                "conflict",
                m.clone(),
            ),
            AppError::InvalidArgument(m) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_argument",
                m.clone(),
            ),
            AppError::Transient(e) => {
                tracing::warn!("transient failure: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "transient_error",
                    "try_again",
                    "temporarily unavailable, retry later".to_string(),
                )
            }
            AppError::Fatal(e) => {
                tracing::error!("fatal deletion failure: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "fatal_error",
                    "deletion_failed",
                    "deletion approved but not completed; operator attention required"
                        .to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if self.is_transient() {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("1"),
            );
        }

        response
    }
}
