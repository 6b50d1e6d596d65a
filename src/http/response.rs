//! Response finishing.
//!
//! # Responsibilities
//! - Turn a handler result into the client response
//! - Record request count and latency per handler
//!
//! # Design Decisions
//! - Backend responses stream through unbuffered
//! - Gateway failures render through `GatewayError`'s JSON body

use std::time::Instant;

use axum::http::Method;
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;
use crate::observability::metrics;

/// Convert `result` and record request metrics.
pub fn finish(
    handler: &'static str,
    method: &Method,
    start: Instant,
    result: Result<Response, GatewayError>,
) -> Response {
    let response = result.into_response();
    metrics::record_request(handler, method.as_str(), response.status().as_u16(), start);
    response
}
