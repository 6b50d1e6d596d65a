//! Client certificate authentication for mutual TLS.
//!
//! The tenant identity of a certificate is its subject Common Name. The
//! listener stores the verified peer chain as a [`PeerCertificates`] request
//! extension; this module only reads it.
//!
//! # Failure Model
//!
//! The authorization middleware rejects with the same 401 body whether the
//! certificate is missing, no tenant was resolved, or the two identities
//! differ. The cause is only logged.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Extensions,
    middleware::Next,
    response::{IntoResponse, Response},
};
use rustls::pki_types::CertificateDer;

use crate::error::GatewayError;
use crate::tenant::TenantContext;

/// Peer certificate chain of the TLS connection, leaf first.
#[derive(Debug, Clone)]
pub struct PeerCertificates(pub Arc<Vec<CertificateDer<'static>>>);

impl PeerCertificates {
    pub fn new(chain: Vec<CertificateDer<'static>>) -> Self {
        Self(Arc::new(chain))
    }

    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.0.first()
    }
}

/// Derives the tenant identity from the client certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertAuthenticator;

impl CertAuthenticator {
    /// Common Name of the leaf peer certificate, or `None` when the
    /// connection presented no certificate.
    pub fn authenticate(&self, extensions: &Extensions) -> Option<String> {
        let leaf = extensions.get::<PeerCertificates>()?.leaf()?;
        common_name(leaf)
    }
}

/// Subject CN of a DER certificate.
pub fn common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = match x509_parser::parse_x509_certificate(cert.as_ref()) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse client certificate");
            return None;
        }
    };

    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    cn
}

/// Middleware requiring the certificate identity to equal the resolved
/// tenant. Install inside [`super::resolve_tenant`].
pub async fn authorize_tenant(
    State(authenticator): State<CertAuthenticator>,
    req: Request,
    next: Next,
) -> Response {
    let identity = authenticator.authenticate(req.extensions());
    let tenant = req
        .extensions()
        .get::<TenantContext>()
        .map(|t| t.tenant_id().to_string());

    match (identity, tenant) {
        (Some(identity), Some(tenant)) if identity == tenant => next.run(req).await,
        (None, _) => {
            tracing::debug!("Rejected request without client certificate");
            GatewayError::Unauthenticated.into_response()
        }
        (Some(_), None) => {
            tracing::debug!("Rejected request without resolved tenant");
            GatewayError::Unauthenticated.into_response()
        }
        (Some(identity), Some(tenant)) => {
            tracing::warn!(certificate = %identity, tenant = %tenant, "Client certificate does not match tenant");
            GatewayError::Unauthenticated.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{TenantConfig, TenantStrategy};
    use crate::tenant::{resolve_tenant, TenantResolver};
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use tower::ServiceExt;

    fn certificate(cn: &str) -> CertificateDer<'static> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let key_pair = KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().der().clone()
    }

    fn app(strategy: TenantStrategy) -> Router {
        let resolver = TenantResolver::new(&TenantConfig {
            strategy,
            ..Default::default()
        })
        .unwrap();
        Router::new()
            .route("/{tenant_id}/api/v1/query", get(|| async { "ok" }))
            .route_layer(middleware::from_fn_with_state(CertAuthenticator, authorize_tenant))
            .route_layer(middleware::from_fn_with_state(Arc::new(resolver), resolve_tenant))
    }

    async fn call(app: Router, cert: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut req = axum::http::Request::get("/tenant1/api/v1/query")
            .body(Body::empty())
            .unwrap();
        if let Some(cn) = cert {
            req.extensions_mut()
                .insert(PeerCertificates::new(vec![certificate(cn)]));
        }
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn extracts_common_name() {
        let mut extensions = Extensions::new();
        assert_eq!(CertAuthenticator.authenticate(&extensions), None);

        extensions.insert(PeerCertificates::new(vec![certificate("tenant1")]));
        assert_eq!(
            CertAuthenticator.authenticate(&extensions).as_deref(),
            Some("tenant1")
        );
    }

    #[test]
    fn garbage_certificate_has_no_identity() {
        let mut extensions = Extensions::new();
        extensions.insert(PeerCertificates::new(vec![CertificateDer::from(vec![1, 2, 3])]));
        assert_eq!(CertAuthenticator.authenticate(&extensions), None);
    }

    #[tokio::test]
    async fn matching_certificate_is_authorized() {
        let (status, _) = call(app(TenantStrategy::Path), Some("tenant1")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn every_failure_is_an_identical_401() {
        let (missing, missing_body) = call(app(TenantStrategy::Path), None).await;
        let (mismatch, mismatch_body) = call(app(TenantStrategy::Path), Some("tenant2")).await;

        assert_eq!(missing, StatusCode::UNAUTHORIZED);
        assert_eq!(mismatch, StatusCode::UNAUTHORIZED);
        assert_eq!(missing_body, mismatch_body);
    }

    #[tokio::test]
    async fn missing_tenant_is_401() {
        let app = Router::new()
            .route("/api/v1/query", get(|| async { "ok" }))
            .route_layer(middleware::from_fn_with_state(CertAuthenticator, authorize_tenant));
        let mut req = axum::http::Request::get("/api/v1/query")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(PeerCertificates::new(vec![certificate("tenant1")]));

        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
