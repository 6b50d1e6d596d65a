//! Gateway error taxonomy.
//!
//! # Responsibilities
//! - One tagged variant per failure class the request pipeline can produce
//! - Map every variant to an HTTP status and a stable reason code
//! - Render a short Prometheus-API-shaped error body
//!
//! # Design Decisions
//! - Callers `match` on the variant; nothing inspects error strings
//! - The response body carries a generic message per variant; the detail
//!   string is only logged

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::enforce::EnforceError;

/// Errors surfaced at the HTTP boundary of the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The query or selector could not be parsed.
    #[error("query parse error: {0}")]
    QueryParse(String),

    /// The query already constrains the tenant label to something else.
    #[error("illegal label matcher: {0}")]
    IllegalLabelMatcher(String),

    /// Internal failure while rewriting the expression tree.
    #[error("label enforcement failed: {0}")]
    EnforceLabel(String),

    #[error("no tenant could be resolved for the request")]
    TenantNotFound,

    /// Certificate missing, tenant missing, or identities differ.
    #[error("request is not authenticated")]
    Unauthenticated,

    /// No backend proxy was configured for the endpoint.
    #[error("no {0} backend configured")]
    BackendUnconfigured(&'static str),

    #[error("tenant {0} is not admitted for writes")]
    TenantNotAdmitted(String),

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream did not respond in time")]
    UpstreamTimeout,
}

impl GatewayError {
    /// HTTP status returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::QueryParse(_)
            | GatewayError::IllegalLabelMatcher(_)
            | GatewayError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::EnforceLabel(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::TenantNotFound => StatusCode::NOT_FOUND,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::BackendUnconfigured(_) => StatusCode::NOT_ACCEPTABLE,
            GatewayError::TenantNotAdmitted(_) => StatusCode::FORBIDDEN,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::QueryParse(_) | GatewayError::InvalidBody(_) => "bad_data",
            GatewayError::IllegalLabelMatcher(_) => "illegal_matcher",
            GatewayError::EnforceLabel(_) => "internal",
            GatewayError::TenantNotFound => "tenant_not_found",
            GatewayError::Unauthenticated => "unauthorized",
            GatewayError::BackendUnconfigured(_) => "not_acceptable",
            GatewayError::TenantNotAdmitted(_) => "forbidden",
            GatewayError::PayloadTooLarge(_) => "too_large",
            GatewayError::Upstream(_) => "unavailable",
            GatewayError::UpstreamTimeout => "timeout",
        }
    }

    /// Message shown to the client. Never includes parser or TLS internals.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::QueryParse(_) => "error parsing query".to_string(),
            GatewayError::IllegalLabelMatcher(_) => {
                "query contains an illegal tenant label matcher".to_string()
            }
            GatewayError::EnforceLabel(_) => "internal error".to_string(),
            GatewayError::TenantNotFound => "tenant not found".to_string(),
            GatewayError::Unauthenticated => "unauthorized".to_string(),
            GatewayError::BackendUnconfigured(kind) => format!("{kind} backend is not configured"),
            GatewayError::TenantNotAdmitted(_) => "tenant is not allowed to write".to_string(),
            GatewayError::InvalidBody(_) => "invalid request body".to_string(),
            GatewayError::PayloadTooLarge(limit) => format!("request body exceeds {limit} bytes"),
            GatewayError::Upstream(_) => "upstream request failed".to_string(),
            GatewayError::UpstreamTimeout => "upstream request timed out".to_string(),
        }
    }
}

impl From<EnforceError> for GatewayError {
    fn from(err: EnforceError) -> Self {
        match err {
            EnforceError::QueryParse(msg) => GatewayError::QueryParse(msg),
            EnforceError::IllegalLabelMatcher(msg) => GatewayError::IllegalLabelMatcher(msg),
            EnforceError::EnforceLabel(msg) => GatewayError::EnforceLabel(msg),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    #[serde(rename = "errorType")]
    error_type: &'static str,
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(reason = self.reason(), error = %self, "Request failed");
        } else {
            tracing::debug!(reason = self.reason(), error = %self, "Request rejected");
        }

        let body = ErrorBody {
            status: "error",
            error_type: self.reason(),
            error: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}
