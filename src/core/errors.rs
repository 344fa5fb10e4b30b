use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("embedding model error: {0}")]
    Model(String),
    #[error("vector store error: {0}")]
    Store(String),
    #[error("upstream LLM error: {0}")]
    Upstream(String),
    #[error("indexing failed: {0}")]
    Index(Box<ApiError>),
    #[error("indexing queue is full")]
    Backpressure,
    #[error("RAG subsystem is disabled")]
    Disabled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }

    pub fn model<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Model(err.to_string())
    }

    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Store(err.to_string())
    }

    pub fn upstream<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Upstream(err.to_string())
    }

    pub fn index(err: ApiError) -> Self {
        match err {
            ApiError::Index(_) => err,
            other => ApiError::Index(Box::new(other)),
        }
    }

    /// Stable machine-readable kind, used in the HTTP error body.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::PermissionDenied(_) => "permission_denied",
            ApiError::NotFound(_) => "not_found",
            ApiError::Validation(_) => "validation",
            ApiError::Conflict(_) => "conflict",
            ApiError::Model(_) => "model_error",
            ApiError::Store(_) => "store_error",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Index(_) => "index_error",
            ApiError::Backpressure => "backpressure",
            ApiError::Disabled => "disabled",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Backpressure | ApiError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Model(_)
            | ApiError::Store(_)
            | ApiError::Upstream(_)
            | ApiError::Index(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
