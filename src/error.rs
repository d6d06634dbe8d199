//! error.rs — API error type shared by every route.
//!
//! Each variant maps to one HTTP status; the body is always `{"error": ...}`
//! so the front end can surface the message as-is.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unsupported database type: {0}")]
    UnsupportedDatabase(String),

    /// Driver-level failure (connect, ping, bad credentials). The driver
    /// message is passed through to the caller.
    #[error("{0}")]
    Database(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Potential SQL injection detected")]
    MaliciousQuery,

    #[error("Query contains sensitive keywords ({}); resend with confirmed=true to run it", .0.join(", "))]
    ConfirmationRequired(Vec<String>),

    #[error("{0}")]
    NotFound(String),

    /// A vendor API answered with an error or an unusable body.
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_)
            | ApiError::UnsupportedDatabase(_)
            | ApiError::Database(_)
            | ApiError::MaliciousQuery => StatusCode::BAD_REQUEST,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ConfirmationRequired(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::ConfirmationRequired(keywords) => json!({
                "error": self.to_string(),
                "requiresConfirmation": true,
                "keywords": keywords,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Upstream(format!("Request failed: {err}"))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(database_message(&err))
    }
}

/// Driver message without sqlx's "error returned from database:" prefix.
pub fn database_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_route_contracts() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::UnsupportedDatabase("oracle".into()).to_string(),
            "Unsupported database type: oracle"
        );
        assert_eq!(ApiError::PermissionDenied("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::ConfirmationRequired(vec!["DROP".into()]).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::Upstream("x".into()).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn confirmation_message_lists_keywords() {
        let err = ApiError::ConfirmationRequired(vec!["DELETE".into(), "DROP".into()]);
        assert!(err.to_string().contains("DELETE, DROP"));
    }
}
