//! HTTP façade
//!
//! A thin axum layer over [`Client`](crate::Client). Every response uses the
//! same envelope:
//!
//! ```json
//! { "ok": true, "data": { ... }, "error": null, "details": null }
//! ```
//!
//! Validation faults map to 400, missing entities to 404, a blocked
//! destruction to 409 and storage faults to 503 (retry is safe).

pub mod app;
pub mod handlers;

pub use app::{build_router, AppState};

use crate::compliance::DestructionResult;
use crate::core::{DbError, ErrorKind};
use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

/// Details attached to a refused destruction.
pub const BLOCKED_DETAILS: &str = "Deletion blocked due to legal hold / protected backup";

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub details: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            details: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn err(error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
            details,
        }
    }
}

#[derive(Debug)]
pub enum WebError {
    Database(DbError),
    Input(String),
    /// Destruction refused by a guard; not a fault, but not a success either.
    Blocked(DestructionResult),
}

impl From<DbError> for WebError {
    fn from(err: DbError) -> Self {
        WebError::Database(err)
    }
}

impl From<JsonRejection> for WebError {
    fn from(rejection: JsonRejection) -> Self {
        WebError::Input(rejection.body_text())
    }
}

impl From<PathRejection> for WebError {
    fn from(rejection: PathRejection) -> Self {
        WebError::Input(rejection.body_text())
    }
}

impl From<QueryRejection> for WebError {
    fn from(rejection: QueryRejection) -> Self {
        WebError::Input(rejection.body_text())
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        match self {
            WebError::Blocked(result) => {
                let body = ApiResponse {
                    ok: false,
                    error: Some(result.reason.clone()),
                    data: Some(result),
                    details: Some(BLOCKED_DETAILS.to_string()),
                };
                (StatusCode::CONFLICT, Json(body)).into_response()
            }
            WebError::Input(message) => (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::err("invalid request", Some(message))),
            )
                .into_response(),
            WebError::Database(err) => {
                let (status, error) = match err.kind() {
                    ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation failed"),
                    ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not found"),
                    ErrorKind::Storage => {
                        warn!(error = %err, "storage fault while serving request");
                        (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable, retry")
                    }
                };
                (status, Json(ApiResponse::err(error, Some(err.to_string())))).into_response()
            }
        }
    }
}

pub type WebResult<T> = std::result::Result<T, WebError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UserId;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DbError::validation("blank reason"), StatusCode::BAD_REQUEST),
            (DbError::not_found("user 9"), StatusCode::NOT_FOUND),
            (
                DbError::LockTimeout("user 9".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(WebError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_blocked_is_conflict() {
        let response = WebError::Blocked(DestructionResult {
            user_id: UserId(1),
            allowed: false,
            reason: "active legal hold".into(),
            keys_destroyed: 0,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
