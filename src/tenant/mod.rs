//! Tenant identification.
//!
//! # Data Flow
//! ```text
//! Request (route params, headers, TLS peer certificates)
//!     → TenantResolver::resolve (one strategy per deployment)
//!     → TenantContext inserted as a request extension
//!     → cert.rs authorization (mutual TLS only)
//!     → handlers read TenantContext
//! ```
//!
//! # Design Decisions
//! - An empty tenant never reaches a handler; resolution failure is a 404,
//!   or under the certificate strategy the same 401 as a rejected certificate
//! - The strategy is fixed at startup

pub mod cert;

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, RawPathParams, Request, State},
    http::{request::Parts, HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::schema::{TenantConfig, TenantStrategy};
use crate::error::GatewayError;

pub use cert::{authorize_tenant, CertAuthenticator, PeerCertificates};

/// Identity of the tenant a request acts for. Immutable for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: String,
}

impl TenantContext {
    /// `None` for an empty identifier.
    pub fn new(tenant_id: impl Into<String>) -> Option<Self> {
        let tenant_id = tenant_id.into();
        if tenant_id.is_empty() {
            None
        } else {
            Some(Self { tenant_id })
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

/// Extracts the tenant using the configured strategy.
#[derive(Debug, Clone)]
pub struct TenantResolver {
    strategy: TenantStrategy,
    path_param: String,
    header: HeaderName,
    authenticator: CertAuthenticator,
}

impl TenantResolver {
    pub fn new(config: &TenantConfig) -> Result<Self, axum::http::header::InvalidHeaderName> {
        Ok(Self {
            strategy: config.strategy,
            path_param: config.path_param.clone(),
            header: HeaderName::try_from(config.header.as_str())?,
            authenticator: CertAuthenticator,
        })
    }

    pub fn strategy(&self) -> TenantStrategy {
        self.strategy
    }

    /// Route parameter naming the tenant under the path strategy.
    pub fn path_param(&self) -> &str {
        &self.path_param
    }

    /// Error answered when no tenant resolves. Under the certificate
    /// strategy this is the same 401 as every other certificate failure.
    pub fn resolution_error(&self) -> GatewayError {
        match self.strategy {
            TenantStrategy::Certificate => GatewayError::Unauthenticated,
            TenantStrategy::Path | TenantStrategy::Header => GatewayError::TenantNotFound,
        }
    }

    /// Resolve from request parts. `path_params` are the matched route
    /// parameters.
    pub fn resolve<'a>(
        &self,
        parts: &Parts,
        mut path_params: impl Iterator<Item = (&'a str, &'a str)>,
    ) -> Option<TenantContext> {
        let tenant = match self.strategy {
            TenantStrategy::Path => path_params
                .find(|(name, _)| *name == self.path_param)
                .map(|(_, value)| value.to_string()),
            TenantStrategy::Header => parts
                .headers
                .get(&self.header)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            TenantStrategy::Certificate => self.authenticator.authenticate(&parts.extensions),
        };
        tenant.and_then(TenantContext::new)
    }
}

/// Middleware attaching [`TenantContext`]; answers
/// [`TenantResolver::resolution_error`] when none resolves.
///
/// Install with `route_layer` so matched route parameters are available.
pub async fn resolve_tenant(
    State(resolver): State<Arc<TenantResolver>>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let params = RawPathParams::from_request_parts(&mut parts, &()).await.ok();
    let params = params.iter().flat_map(|p| p.iter());

    let Some(tenant) = resolver.resolve(&parts, params) else {
        tracing::debug!(path = %parts.uri.path(), "No tenant resolved");
        return resolver.resolution_error().into_response();
    };

    tracing::trace!(tenant = %tenant.tenant_id(), "Tenant resolved");
    parts.extensions.insert(tenant);
    next.run(Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    fn resolver(strategy: TenantStrategy) -> Arc<TenantResolver> {
        let config = TenantConfig {
            strategy,
            ..Default::default()
        };
        Arc::new(TenantResolver::new(&config).unwrap())
    }

    fn app(resolver: Arc<TenantResolver>, path: &str) -> Router {
        Router::new()
            .route(
                path,
                get(|Extension(tenant): Extension<TenantContext>| async move {
                    tenant.tenant_id().to_string()
                }),
            )
            .route_layer(middleware::from_fn_with_state(resolver, resolve_tenant))
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, String) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn empty_tenant_is_rejected() {
        assert!(TenantContext::new("").is_none());
        assert_eq!(TenantContext::new("t").unwrap().tenant_id(), "t");
    }

    #[tokio::test]
    async fn path_strategy_reads_route_param() {
        let app = app(resolver(TenantStrategy::Path), "/{tenant_id}/api/v1/query");
        let req = axum::http::Request::get("/tenant1/api/v1/query").body(Body::empty()).unwrap();
        assert_eq!(call(app, req).await, (StatusCode::OK, "tenant1".to_string()));
    }

    #[tokio::test]
    async fn header_strategy_reads_header() {
        let app = app(resolver(TenantStrategy::Header), "/api/v1/query");
        let req = axum::http::Request::get("/api/v1/query")
            .header("WHIZARD-TENANT", "tenant2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(app, req).await, (StatusCode::OK, "tenant2".to_string()));
    }

    #[tokio::test]
    async fn missing_or_empty_tenant_is_not_found() {
        let app = app(resolver(TenantStrategy::Header), "/api/v1/query");

        let req = axum::http::Request::get("/api/v1/query").body(Body::empty()).unwrap();
        assert_eq!(call(app.clone(), req).await.0, StatusCode::NOT_FOUND);

        let req = axum::http::Request::get("/api/v1/query")
            .header("WHIZARD-TENANT", "")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(app, req).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn certificate_strategy_without_certificate_is_unauthorized() {
        let app = app(resolver(TenantStrategy::Certificate), "/api/v1/query");
        let req = axum::http::Request::get("/api/v1/query").body(Body::empty()).unwrap();
        let (status, body) = call(app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let expected = GatewayError::Unauthenticated.into_response().into_body();
        let expected = axum::body::to_bytes(expected, usize::MAX).await.unwrap();
        assert_eq!(body.as_bytes(), &expected[..]);
    }
}
