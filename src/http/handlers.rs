//! Endpoint handlers.
//!
//! # Data Flow
//! ```text
//! query, query_range            → enforce `query` (URL and form body)
//! series, labels, label values,
//! rules, alerts                 → inject tenant into `match[]`
//! receive                       → admission check → RemoteWriteRelay
//! ```
//!
//! Every handler runs after tenant resolution, so a `TenantContext` is
//! always present.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::uri::PathAndQuery;
use axum::http::{header, HeaderValue, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Extension;

use crate::enforce::{enforce_query_values, inject_matcher, QueryValues, TenantMatcher, MATCH_PARAM};
use crate::error::GatewayError;
use crate::http::request::buffer_body;
use crate::http::response::finish;
use crate::http::server::AppState;
use crate::proxy::ReverseProxy;
use crate::tenant::TenantContext;

const FORM_MEDIA_TYPE: &str = "application/x-www-form-urlencoded";

/// Which parameter carries the tenant scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// PromQL expression in `query`.
    Expression,
    /// Repeatable `match[]` selectors.
    Selectors,
}

pub async fn query(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    req: Request,
) -> Response {
    scoped("query", &state, &tenant, Scope::Expression, state.query.as_deref(), req).await
}

pub async fn query_range(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    req: Request,
) -> Response {
    scoped("query_range", &state, &tenant, Scope::Expression, state.query.as_deref(), req).await
}

pub async fn series(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    req: Request,
) -> Response {
    scoped("series", &state, &tenant, Scope::Selectors, state.query.as_deref(), req).await
}

pub async fn labels(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    req: Request,
) -> Response {
    scoped("labels", &state, &tenant, Scope::Selectors, state.query.as_deref(), req).await
}

pub async fn label_values(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    req: Request,
) -> Response {
    scoped("label_values", &state, &tenant, Scope::Selectors, state.query.as_deref(), req).await
}

pub async fn rules(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    req: Request,
) -> Response {
    scoped("rules", &state, &tenant, Scope::Selectors, state.rules.as_deref(), req).await
}

pub async fn alerts(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    req: Request,
) -> Response {
    scoped("alerts", &state, &tenant, Scope::Selectors, state.rules.as_deref(), req).await
}

pub async fn receive(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    req: Request,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();

    let result = async {
        if let Some(admission) = &state.admission {
            if !admission.is_admitted(tenant.tenant_id()) {
                return Err(GatewayError::TenantNotAdmitted(tenant.tenant_id().to_string()));
            }
        }
        state.remote_write.relay(&tenant, req).await
    }
    .await;

    finish("receive", &method, start, result)
}

pub async fn healthy() -> &'static str {
    "OK"
}

pub async fn ready(State(state): State<AppState>) -> Response {
    if state.is_ready() {
        "OK".into_response()
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn scoped(
    handler: &'static str,
    state: &AppState,
    tenant: &TenantContext,
    scope: Scope,
    backend: Option<&ReverseProxy>,
    req: Request,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();

    let result = async {
        let proxy = backend.ok_or(GatewayError::BackendUnconfigured(backend_kind(handler)))?;
        let matcher = TenantMatcher::new(state.tenant_label.as_ref(), tenant.tenant_id());
        let req = enforce_request(req, &matcher, scope, state.max_body_size).await?;
        proxy.forward(req).await
    }
    .await;

    if let Err(e) = &result {
        tracing::debug!(handler, tenant = %tenant.tenant_id(), error = %e, "Request rejected");
    }
    finish(handler, &method, start, result)
}

fn backend_kind(handler: &str) -> &'static str {
    match handler {
        "rules" | "alerts" => "rules",
        _ => "query",
    }
}

/// Scope the URL query string and, for form posts, the body.
async fn enforce_request(
    req: Request,
    matcher: &TenantMatcher,
    scope: Scope,
    max_body_size: usize,
) -> Result<Request, GatewayError> {
    let (mut parts, body) = req.into_parts();
    let form_post = is_form_post(&parts);

    let mut url_values = QueryValues::parse(parts.uri.query().unwrap_or_default().as_bytes());
    let url_has_selectors = !url_values.get_all(MATCH_PARAM).is_empty();

    let url_changed = match scope {
        Scope::Expression => enforce_query_values(&mut url_values, matcher)?,
        // A form post may carry its selectors only in the body.
        Scope::Selectors if url_has_selectors || !form_post => {
            inject_matcher(&mut url_values, matcher, MATCH_PARAM)?;
            true
        }
        Scope::Selectors => false,
    };
    if url_changed {
        parts.uri = replace_query(&parts.uri, &url_values.encode())?;
    }

    if !form_post {
        return Ok(Request::from_parts(parts, body));
    }

    let bytes = buffer_body(body, max_body_size).await?;
    let mut form = QueryValues::parse(&bytes);
    let form_changed = match scope {
        Scope::Expression => enforce_query_values(&mut form, matcher)?,
        Scope::Selectors if !form.get_all(MATCH_PARAM).is_empty() || !url_has_selectors => {
            inject_matcher(&mut form, matcher, MATCH_PARAM)?;
            true
        }
        Scope::Selectors => false,
    };

    let body = if form_changed {
        let encoded = form.encode();
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(encoded.len()));
        Body::from(encoded)
    } else {
        Body::from(bytes)
    };
    Ok(Request::from_parts(parts, body))
}

fn is_form_post(parts: &Parts) -> bool {
    parts.method == Method::POST
        && parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|media| media.trim().eq_ignore_ascii_case(FORM_MEDIA_TYPE))
}

fn replace_query(uri: &Uri, query: &str) -> Result<Uri, GatewayError> {
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), query)
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query)
            .map_err(|e| GatewayError::InvalidBody(e.to_string()))?,
    );
    Uri::from_parts(parts).map_err(|e| GatewayError::InvalidBody(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> TenantMatcher {
        TenantMatcher::new("tenant_id", "tenant1")
    }

    fn query_of(req: &Request) -> QueryValues {
        QueryValues::parse(req.uri().query().unwrap_or_default().as_bytes())
    }

    async fn body_of(req: Request) -> (Option<String>, String) {
        let length = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
        (length, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn get_query_is_enforced() {
        let req = axum::http::Request::get("/api/v1/query?query=up&time=1")
            .body(Body::empty())
            .unwrap();
        let req = enforce_request(req, &matcher(), Scope::Expression, 1024).await.unwrap();

        let values = query_of(&req);
        assert!(values.get("query").unwrap().contains(r#"tenant_id="tenant1""#));
        assert_eq!(values.get("time"), Some("1"));
        assert_eq!(req.uri().path(), "/api/v1/query");
    }

    #[tokio::test]
    async fn missing_query_is_untouched() {
        let req = axum::http::Request::get("/api/v1/query?time=1")
            .body(Body::empty())
            .unwrap();
        let req = enforce_request(req, &matcher(), Scope::Expression, 1024).await.unwrap();
        assert_eq!(req.uri().query(), Some("time=1"));
    }

    #[tokio::test]
    async fn form_body_is_enforced_and_length_recomputed() {
        let req = axum::http::Request::post("/api/v1/query")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::CONTENT_LENGTH, "8")
            .body(Body::from("query=up"))
            .unwrap();
        let req = enforce_request(req, &matcher(), Scope::Expression, 1024).await.unwrap();

        let (length, body) = body_of(req).await;
        let form = QueryValues::parse(body.as_bytes());
        assert!(form.get("query").unwrap().contains(r#"tenant_id="tenant1""#));
        assert_eq!(length, Some(body.len().to_string()));
    }

    #[tokio::test]
    async fn form_media_type_is_case_insensitive() {
        let req = axum::http::Request::post("/api/v1/query")
            .header(header::CONTENT_TYPE, "Application/X-WWW-Form-Urlencoded; charset=UTF-8")
            .body(Body::from("query=secret_metric"))
            .unwrap();
        let req = enforce_request(req, &matcher(), Scope::Expression, 1024).await.unwrap();

        let (_, body) = body_of(req).await;
        let form = QueryValues::parse(body.as_bytes());
        let query = form.get("query").unwrap();
        assert!(query.starts_with("secret_metric{"));
        assert!(query.contains(r#"tenant_id="tenant1""#));
    }

    #[test]
    fn other_media_types_are_not_forms() {
        let post = |ct: &str| {
            let (parts, _) = axum::http::Request::post("/api/v1/query")
                .header(header::CONTENT_TYPE, ct)
                .body(())
                .unwrap()
                .into_parts();
            is_form_post(&parts)
        };
        assert!(post(" application/x-www-form-urlencoded ;charset=utf-8"));
        assert!(!post("application/x-www-form-urlencodedx"));
        assert!(!post("multipart/form-data"));
    }

    #[tokio::test]
    async fn selectors_default_to_tenant_only() {
        let req = axum::http::Request::get("/api/v1/labels")
            .body(Body::empty())
            .unwrap();
        let req = enforce_request(req, &matcher(), Scope::Selectors, 1024).await.unwrap();
        assert_eq!(query_of(&req).get_all(MATCH_PARAM), vec![r#"{tenant_id="tenant1"}"#]);
    }

    #[tokio::test]
    async fn form_selectors_stay_in_body() {
        let req = axum::http::Request::post("/api/v1/series")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("match%5B%5D=up&match%5B%5D=process_start_time_seconds"))
            .unwrap();
        let req = enforce_request(req, &matcher(), Scope::Selectors, 1024).await.unwrap();

        assert!(query_of(&req).get_all(MATCH_PARAM).is_empty());
        let (_, body) = body_of(req).await;
        let form = QueryValues::parse(body.as_bytes());
        assert_eq!(
            form.get_all(MATCH_PARAM),
            vec![
                r#"up{tenant_id="tenant1"}"#,
                r#"process_start_time_seconds{tenant_id="tenant1"}"#
            ]
        );
    }

    #[tokio::test]
    async fn parse_errors_surface_as_bad_request() {
        let req = axum::http::Request::get("/api/v1/query?query=sum(")
            .body(Body::empty())
            .unwrap();
        let err = enforce_request(req, &matcher(), Scope::Expression, 1024)
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn replaces_query_only() {
        let uri: Uri = "/api/v1/series?match%5B%5D=up".parse().unwrap();
        assert_eq!(replace_query(&uri, "a=b").unwrap().to_string(), "/api/v1/series?a=b");
        assert_eq!(replace_query(&uri, "").unwrap().to_string(), "/api/v1/series");
    }
}
