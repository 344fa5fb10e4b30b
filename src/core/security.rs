//! Request principal resolution.
//!
//! Authentication proper lives in the outer gateway; by the time a request
//! reaches this service the bearer token has already been issued to exactly
//! one user, so the token value is taken as the user principal. The only
//! checks performed here are presence and well-formedness.

use axum::http::{header, HeaderMap};

use crate::core::errors::ApiError;

const BEARER_PREFIX: &str = "Bearer ";

/// Resolve the authenticated user id from the `Authorization` header.
pub fn resolve_user(headers: &HeaderMap) -> Result<String, ApiError> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let token = header_value
        .strip_prefix(BEARER_PREFIX)
        .map(str::trim)
        .unwrap_or("");

    if token.is_empty() {
        return Err(ApiError::Unauthorized);
    }

    Ok(token.to_string())
}
