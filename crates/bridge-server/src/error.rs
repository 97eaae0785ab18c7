//! Application error types.
//!
//! Every handler returns `Result<T, AppError>`. `AppError` implements
//! `axum::response::IntoResponse` directly so handlers never hand-roll status
//! codes, and `Serialize` so the same type doubles as the JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-level errors.
///
/// All variants serialize to a structured JSON object `{"type": ..., "details": ...}`
/// for API consumers.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// Upstream API request failed for a reason other than the dedicated variants below.
    #[error("Upstream error: {message}")]
    Upstream {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
    },

    /// Network request to upstream failed (timeout, connect failure, DNS).
    #[error("Network error: {message}")]
    Network { message: String },

    /// Invalid input or request state (e.g. unknown client_id, malformed user_code).
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Requested resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Caller is not authenticated, or the bearer/session token is invalid.
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    /// Upstream refresh token was rejected as revoked (invalid_grant / invalid_token / access_denied).
    #[error("Token revoked: {message}")]
    TokenRevoked { message: String },

    /// RFC 8628 device-flow polling states, reported verbatim in the token response body.
    #[error("Device flow: {error}")]
    DeviceFlow {
        error: DeviceFlowError,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_description: Option<String>,
    },

    /// The device's section has no term active today.
    #[error("Not in active term")]
    NotInActiveTerm,

    /// The upstream profile has no section matching the device's configured section_id.
    #[error("Section not found: {section_id}")]
    SectionNotFound { section_id: String },

    /// A caller-scoped temporary block is in effect (upstream returned 429).
    #[error("User temporarily blocked until {retry_after}s from now")]
    UserBlocked { retry_after: i64 },

    /// The service-wide block is in effect (upstream returned X-Blocked).
    #[error("Service is blocked by upstream, manual intervention required")]
    ServiceBlocked,

    /// A fixed-window rate limit was exceeded.
    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: i64 },

    /// Internal application error / violated invariant.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// The RFC 8628 `error` field values for the `/device/token` endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFlowError {
    AuthorizationPending,
    SlowDown,
    AccessDenied,
    ExpiredToken,
    InvalidGrant,
    InvalidRequest,
    UnsupportedGrantType,
}

impl AppError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    pub fn database_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn upstream_with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self::Upstream {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_input_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    pub fn not_found_with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn token_revoked(message: impl Into<String>) -> Self {
        Self::TokenRevoked {
            message: message.into(),
        }
    }

    pub fn device_flow(error: DeviceFlowError) -> Self {
        Self::DeviceFlow {
            error,
            error_description: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors that should not count against an exponential-style client backoff
    /// (the caller should retry on its own schedule rather than give up).
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::UserBlocked { .. } | Self::ServiceBlocked | Self::RateLimited { .. } | Self::Network { .. }
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Database { .. } | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { .. } | Self::Network { .. } => StatusCode::BAD_GATEWAY,
            Self::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } | Self::SectionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Authentication { .. } | Self::TokenRevoked { .. } => StatusCode::UNAUTHORIZED,
            Self::DeviceFlow { .. } => StatusCode::BAD_REQUEST,
            Self::NotInActiveTerm => StatusCode::CONFLICT,
            Self::UserBlocked { .. } | Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceBlocked => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, "internal error");
        } else if matches!(self, AppError::ServiceBlocked) {
            tracing::error!("upstream service block in effect");
        }
        let mut response = (status, Json(&self)).into_response();
        if let Self::UserBlocked { retry_after } = &self {
            response
                .headers_mut()
                .insert("Retry-After", retry_after.to_string().parse().unwrap());
        }
        if let Self::RateLimited { retry_after } = &self {
            response
                .headers_mut()
                .insert("Retry-After", retry_after.to_string().parse().unwrap());
        }
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("request to upstream timed out")
        } else if err.is_connect() {
            Self::network("failed to connect to upstream")
        } else if err.is_status() {
            Self::upstream(format!("HTTP error: {err}"))
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = AppError::database("connection failed");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"Database\""));
        assert!(json.contains("connection failed"));
    }

    #[test]
    fn test_not_found_with_id() {
        let err = AppError::not_found_with_id("DeviceCode", "abc123");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"resource\":\"DeviceCode\""));
        assert!(json.contains("\"id\":\"abc123\""));
    }

    #[test]
    fn test_optional_fields_not_serialized() {
        let err = AppError::database("error");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("operation"));
    }

    #[test]
    fn test_is_temporary() {
        assert!(AppError::ServiceBlocked.is_temporary());
        assert!(AppError::UserBlocked { retry_after: 60 }.is_temporary());
        assert!(!AppError::invalid_input("bad").is_temporary());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::ServiceBlocked.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::UserBlocked { retry_after: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(AppError::NotInActiveTerm.status_code(), StatusCode::CONFLICT);
    }
}
