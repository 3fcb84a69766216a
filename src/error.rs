use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

/// Error taxonomy of the settlement core.
///
/// Validation and state-conflict failures are returned synchronously with
/// a specific kind. `Dependency` failures are retried by the caller only,
/// never inside the core, where a blind retry of a financial mutation
/// could double its effect.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    ConfigurationMissing(String),
    #[error("{0}")]
    StateConflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    ExpiredToken(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Dependency(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::StateConflict(_) => "state_conflict",
            Self::NotFound(_) => "not_found",
            Self::ExpiredToken(_) => "expired_token",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Dependency(_) => "dependency_error",
            Self::Internal(_) => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::ConfigurationMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StateConflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ExpiredToken(_) => StatusCode::GONE,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Dependency(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), detail = %self, "Request failed");
        }
        let body = Json(json!({
            "error": self.kind(),
            "detail": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AppError::Validation(String::new()).kind(), "validation_error");
        assert_eq!(
            AppError::StateConflict(String::new()).kind(),
            "state_conflict"
        );
        assert_eq!(AppError::ExpiredToken(String::new()).kind(), "expired_token");
    }
}
