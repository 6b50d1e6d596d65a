//! Startup orchestration.
//!
//! # Responsibilities
//! - Build backend transports and reverse proxies
//! - Build the remote-write relay and its external destinations
//! - Load the admission list and start its watcher
//! - Bind the listener and prepare TLS
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - A malformed admission file at startup is an error; later ones only
//!   keep the previous list
//! - Background tasks stop on the shared shutdown token

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderName;
use axum::Router;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::admission::ConfigFileError;
use crate::config::schema::{GatewayConfig, TenantStrategy};
use crate::config::watcher::WatchError;
use crate::config::{AdmissionControl, ConfigWatcher};
use crate::http::{AppState, GatewayServer, RouterOptions};
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::{load_server_config, TlsError};
use crate::proxy::transport::load_transport;
use crate::proxy::{ReverseProxy, TransportError};
use crate::remote_write::{RemoteWriteClient, RemoteWriteRelay};
use crate::tenant::TenantResolver;

use super::Shutdown;

/// Upper bound on waiting for background tasks after the listener stops.
const BACKGROUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid header name {name:?}: {source}")]
    HeaderName {
        name: String,
        #[source]
        source: axum::http::header::InvalidHeaderName,
    },

    #[error("{backend} backend: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("remote write destination {name}: {source}")]
    Destination {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Admission(#[from] ConfigFileError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("listener TLS: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// A fully wired gateway, bound and ready to serve.
pub struct Gateway {
    server: GatewayServer,
    listener: Listener,
    tls: Option<TlsAcceptor>,
    shutdown: Shutdown,
    background: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> Router {
        self.server.router()
    }

    /// Serve until shutdown, then wait for background tasks.
    pub async fn run(self) -> Result<(), ListenerError> {
        let result = self
            .server
            .run(self.listener, self.tls, self.shutdown.token())
            .await;

        // The listener may stop on its own; make sure the watcher follows.
        self.shutdown.trigger();
        let drain = futures_util::future::join_all(self.background);
        if tokio::time::timeout(BACKGROUND_DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("Background tasks did not stop in time");
        }
        result
    }
}

/// Build every subsystem from `config` and bind the listener.
pub async fn start(config: &GatewayConfig, shutdown: &Shutdown) -> Result<Gateway, StartupError> {
    let upstreams = &config.upstreams;
    let strip_tenant = config.tenant.strategy == TenantStrategy::Path;

    let query = match &upstreams.query {
        Some(target) => Some(build_proxy(
            "query",
            target,
            upstreams.query_transport_config.as_deref(),
            upstreams.insecure_skip_verify,
            strip_tenant,
        )?),
        None => None,
    };
    let rules = match &upstreams.rules {
        Some(target) => Some(build_proxy(
            "rules",
            target,
            upstreams.query_transport_config.as_deref(),
            upstreams.insecure_skip_verify,
            strip_tenant,
        )?),
        None => query.clone(),
    };
    let remote_write = match &upstreams.remote_write {
        Some(target) => Some(build_proxy(
            "remote_write",
            target,
            upstreams.remote_write_transport_config.as_deref(),
            upstreams.insecure_skip_verify,
            strip_tenant,
        )?),
        None => None,
    };

    let external = config
        .remote_write
        .external
        .iter()
        .map(|destination| {
            RemoteWriteClient::new(destination).map_err(|source| StartupError::Destination {
                name: destination.name.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let tenant_header = header_name(&config.remote_write.tenant_header)?;
    let relay = RemoteWriteRelay::new(
        tenant_header,
        remote_write,
        external,
        config.listener.max_body_size,
        config.remote_write.max_concurrent_fanouts,
    );

    let mut background = Vec::new();
    let admission = if config.admission.enabled {
        let (watcher, updates) =
            ConfigWatcher::new(&config.admission.config_file, config.admission.poll_interval)?;
        let initial = watcher.validate_config()?;
        tracing::info!(
            path = %watcher.path().display(),
            tenants = initial.tenants.len(),
            "Admission config loaded"
        );

        let control = Arc::new(AdmissionControl::new(initial));
        background.push(control.clone().spawn_consumer(updates));
        background.push(watcher.spawn(shutdown.token()));
        Some(control)
    } else {
        None
    };

    let resolver = TenantResolver::new(&config.tenant).map_err(|source| StartupError::HeaderName {
        name: config.tenant.header.clone(),
        source,
    })?;

    let tls = config
        .listener
        .tls
        .as_ref()
        .map(load_server_config)
        .transpose()?
        .map(TlsAcceptor::from);
    let mutual_tls = config
        .listener
        .tls
        .as_ref()
        .is_some_and(|tls| tls.client_ca_path.is_some());

    let state = AppState::new(
        &config.tenant.label,
        query,
        rules,
        relay,
        admission,
        config.listener.max_body_size,
    );
    let server = GatewayServer::new(
        state,
        RouterOptions {
            resolver: Arc::new(resolver),
            mutual_tls,
            request_timeout: Duration::from_secs(config.timeouts.request_secs),
        },
    );

    let listener = Listener::bind(&config.listener).await?;

    tracing::info!(
        strategy = ?config.tenant.strategy,
        label = %config.tenant.label,
        mutual_tls,
        admission = config.admission.enabled,
        destinations = config.remote_write.external.len(),
        "Gateway initialized"
    );

    Ok(Gateway {
        server,
        listener,
        tls,
        shutdown: shutdown.clone(),
        background,
    })
}

fn build_proxy(
    backend: &'static str,
    target: &str,
    transport_config: Option<&std::path::Path>,
    insecure_skip_verify: bool,
    strip_tenant: bool,
) -> Result<ReverseProxy, StartupError> {
    let backend_error = |source| StartupError::Backend { backend, source };
    let transport = load_transport(transport_config, insecure_skip_verify).map_err(backend_error)?;
    ReverseProxy::new(backend, target, transport, strip_tenant).map_err(backend_error)
}

fn header_name(name: &str) -> Result<HeaderName, StartupError> {
    HeaderName::try_from(name).map_err(|source| StartupError::HeaderName {
        name: name.to_string(),
        source,
    })
}
