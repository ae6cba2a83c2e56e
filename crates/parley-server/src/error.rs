use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// No resolvable caller identity.
    #[error("Unauthorized")]
    Unauthorized,

    /// Caller resolved but lacks the required relationship.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed request outside the store's own validation (e.g. an
    /// unparsable subscription key).
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// A required collaborator (the store, the identity mirror) failed;
    /// retryable.
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Domain error surfaced by the store layer.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::DependencyUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ApiError::Store(store) => match store {
                StoreError::NotFound => (StatusCode::NOT_FOUND, store.to_string()),
                StoreError::Forbidden(_) => (StatusCode::FORBIDDEN, store.to_string()),
                StoreError::InvalidParticipants(_)
                | StoreError::InvalidMessage(_)
                | StoreError::InvalidAudience(_) => (StatusCode::BAD_REQUEST, store.to_string()),
                _ => {
                    tracing::error!(error = %store, "store failure");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                    )
                }
            },
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
