//! Error taxonomy and the `{"error": {...}}` envelope (spec §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    AuthenticationError,
    PermissionError,
    NotFound,
    RateLimitError,
    UpstreamError,
    ServiceUnavailable,
    InternalError,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
            ErrorKind::PermissionError => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimitError => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::ServiceUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn wire_name(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimitError => "rate_limit_error",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn missing_model() -> Self {
        Self::new(ErrorKind::InvalidRequest, "missing_model", "model is required")
    }

    pub fn missing_messages() -> Self {
        Self::new(
            ErrorKind::InvalidRequest,
            "missing_messages",
            "messages must not be empty",
        )
    }

    pub fn bad_json(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, "invalid_json", detail)
    }

    pub fn missing_auth() -> Self {
        Self::new(
            ErrorKind::AuthenticationError,
            "missing_api_key",
            "missing bearer token",
        )
    }

    pub fn invalid_auth() -> Self {
        Self::new(
            ErrorKind::AuthenticationError,
            "invalid_api_key",
            "proxy key is unknown or malformed",
        )
    }

    pub fn inactive_key() -> Self {
        Self::new(
            ErrorKind::AuthenticationError,
            "inactive_api_key",
            "proxy key is disabled",
        )
    }

    pub fn group_not_permitted(group_id: &str) -> Self {
        Self::new(
            ErrorKind::PermissionError,
            "group_not_permitted",
            format!("proxy key may not reach group '{group_id}'"),
        )
    }

    pub fn group_not_found(group_id: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            "group_not_found",
            format!("no such group '{group_id}'"),
        )
    }

    pub fn group_disabled(group_id: &str) -> Self {
        Self::new(
            ErrorKind::InvalidRequest,
            "group_disabled",
            format!("group '{group_id}' is disabled"),
        )
    }

    pub fn rate_limited() -> Self {
        Self::new(
            ErrorKind::RateLimitError,
            "rpm_exceeded",
            "rate limit exceeded for the selected group",
        )
    }

    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamError, "upstream_error", detail)
    }

    pub fn no_candidates() -> Self {
        Self::new(
            ErrorKind::ServiceUnavailable,
            "no_candidate_group",
            "no enabled group accepts this model",
        )
    }

    pub fn retry_budget_exhausted() -> Self {
        Self::new(
            ErrorKind::ServiceUnavailable,
            "retry_budget_exhausted",
            "every upstream attempt failed",
        )
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, "internal_error", detail)
    }

    /// Maps the last adapter failure from an exhausted retry walk onto the
    /// wire taxonomy; the client sees `upstream_error` regardless of which
    /// provider or key actually failed.
    pub fn from_provider_error(err: &turnsapi_provider_core::ProviderError) -> Self {
        Self::new(ErrorKind::UpstreamError, "upstream_error", err.to_string())
    }

    pub fn kind_status(&self) -> StatusCode {
        self.kind.status()
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    code: &'a str,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ErrorBody {
            error: ErrorDetail {
                message: &self.message,
                kind: self.kind.wire_name(),
                code: self.code,
            },
        };
        (status, axum::Json(body)).into_response()
    }
}
