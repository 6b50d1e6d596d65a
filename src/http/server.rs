//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the Axum router for the tenant-scoped API
//! - Install tenant resolution and, under mutual TLS, certificate checks
//! - Wire up middleware (tracing, timeout, request ID)
//! - Serve on the bounded listener until shutdown
//!
//! # Route Table
//! ```text
//! {prefix}/api/v1/query              GET POST  → query backend
//! {prefix}/api/v1/query_range        GET POST  → query backend
//! {prefix}/api/v1/series             GET POST  → query backend
//! {prefix}/api/v1/labels             GET POST  → query backend
//! {prefix}/api/v1/label/{name}/values GET      → query backend
//! {prefix}/api/v1/rules              GET POST  → rules backend
//! {prefix}/api/v1/alerts             GET POST  → rules backend
//! {prefix}/api/v1/receive            POST      → remote-write backend
//! /-/healthy, /-/ready               GET
//! ```
//! `{prefix}` is `/{tenant_id}` for the path strategy and empty otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::schema::TenantStrategy;
use crate::config::AdmissionControl;
use crate::http::handlers;
use crate::http::request::{MakeRequestUuidV4, X_REQUEST_ID};
use crate::net::listener::{Listener, ListenerError};
use crate::proxy::ReverseProxy;
use crate::remote_write::RemoteWriteRelay;
use crate::tenant::{authorize_tenant, resolve_tenant, CertAuthenticator, TenantResolver};

/// Application state injected into handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Label bound to the tenant in every query.
    pub tenant_label: Arc<str>,
    pub query: Option<Arc<ReverseProxy>>,
    pub rules: Option<Arc<ReverseProxy>>,
    pub remote_write: Arc<RemoteWriteRelay>,
    /// Write admission list; `None` admits every tenant.
    pub admission: Option<Arc<AdmissionControl>>,
    pub max_body_size: usize,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        tenant_label: &str,
        query: Option<ReverseProxy>,
        rules: Option<ReverseProxy>,
        remote_write: RemoteWriteRelay,
        admission: Option<Arc<AdmissionControl>>,
        max_body_size: usize,
    ) -> Self {
        Self {
            tenant_label: Arc::from(tenant_label),
            query: query.map(Arc::new),
            rules: rules.map(Arc::new),
            remote_write: Arc::new(remote_write),
            admission,
            max_body_size,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

/// Options shaping the route table.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub resolver: Arc<TenantResolver>,
    /// Check client certificates against the resolved tenant.
    pub mutual_tls: bool,
    pub request_timeout: Duration,
}

/// HTTP server for the gateway.
pub struct GatewayServer {
    router: Router,
    state: AppState,
}

impl GatewayServer {
    pub fn new(state: AppState, options: RouterOptions) -> Self {
        let router = build_router(state.clone(), &options);
        Self { router, state }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(
        self,
        listener: Listener,
        tls: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) -> Result<(), ListenerError> {
        let addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(address = %addr, tls = tls.is_some(), "HTTP server starting");

        self.state.set_ready(true);
        let state = self.state.clone();
        let draining = shutdown.clone();
        tokio::spawn(async move {
            draining.cancelled().await;
            state.set_ready(false);
        });

        listener.serve(self.router, tls, shutdown).await?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(state: AppState, options: &RouterOptions) -> Router {
    let prefix = match options.resolver.strategy() {
        TenantStrategy::Path => format!("/{{{}}}", options.resolver.path_param()),
        TenantStrategy::Header | TenantStrategy::Certificate => String::new(),
    };
    let route = |path: &str| format!("{prefix}/api/v1/{path}");

    let mut api = Router::new()
        .route(&route("query"), get(handlers::query).post(handlers::query))
        .route(&route("query_range"), get(handlers::query_range).post(handlers::query_range))
        .route(&route("series"), get(handlers::series).post(handlers::series))
        .route(&route("labels"), get(handlers::labels).post(handlers::labels))
        .route(&route("label/{name}/values"), get(handlers::label_values))
        .route(&route("rules"), get(handlers::rules).post(handlers::rules))
        .route(&route("alerts"), get(handlers::alerts).post(handlers::alerts))
        .route(&route("receive"), axum::routing::post(handlers::receive));

    // Layers added later run first: resolve the tenant, then authorize it.
    if options.mutual_tls {
        api = api.route_layer(middleware::from_fn_with_state(
            CertAuthenticator,
            authorize_tenant,
        ));
    }
    let api = api.route_layer(middleware::from_fn_with_state(
        options.resolver.clone(),
        resolve_tenant,
    ));

    Router::new()
        .route("/-/healthy", get(handlers::healthy))
        .route("/-/ready", get(handlers::ready))
        .merge(api)
        .with_state(state)
        .layer(TimeoutLayer::new(options.request_timeout))
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuidV4))
}
