//! TCP listener with backpressure and optional TLS termination.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Enforce max_connections via semaphore
//! - Terminate TLS and capture the peer certificate chain
//! - Serve each connection with hyper, draining on shutdown
//!
//! # Design Decisions
//! - Each request carries `ConnectInfo` and, under TLS, `PeerCertificates`
//!   as extensions; handlers never see the transport
//! - The permit is held for the whole connection lifetime

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service;

use crate::config::schema::ListenerConfig;
use crate::tenant::PeerCertificates;

/// How long open connections may keep running after shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// A bounded TCP listener that limits concurrent connections.
///
/// When the limit is reached, accepting waits until a connection closes.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let inner = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        Ok(Self::from_listener(inner, config.max_connections))
    }

    /// Wrap an already bound listener.
    pub fn from_listener(inner: TcpListener, max_connections: usize) -> Self {
        if let Ok(addr) = inner.local_addr() {
            tracing::info!(address = %addr, max_connections, "Listener bound");
        }
        Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Accept a connection once a slot is free.
    pub async fn accept(
        &self,
    ) -> Result<(TcpStream, SocketAddr, OwnedSemaphorePermit), ListenerError> {
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ListenerError::Accept(std::io::Error::other(e)))?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        tracing::trace!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );
        Ok((stream, addr, permit))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Serve `router` until `shutdown` fires, then drain open connections.
    pub async fn serve(
        self,
        router: Router,
        tls: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) -> Result<(), ListenerError> {
        let tracker = TaskTracker::new();

        loop {
            let (stream, peer_addr, permit) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }

            let router = router.clone();
            let tls = tls.clone();
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                let _permit = permit;
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => {
                            let certs = stream
                                .get_ref()
                                .1
                                .peer_certificates()
                                .map(|chain| PeerCertificates::new(chain.to_vec()));
                            serve_connection(stream, peer_addr, certs, router, shutdown).await;
                        }
                        Err(e) => {
                            tracing::debug!(peer_addr = %peer_addr, error = %e, "TLS handshake failed");
                        }
                    },
                    None => serve_connection(stream, peer_addr, None, router, shutdown).await,
                }
            });
        }

        tracker.close();
        tracing::info!(connections = tracker.len(), "Draining connections");
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
            tracing::warn!("Connection drain timed out");
        }
        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    certs: Option<PeerCertificates>,
    router: Router,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let svc = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer_addr));
        if let Some(certs) = &certs {
            req.extensions_mut().insert(certs.clone());
        }
        router.clone().call(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(peer_addr = %peer_addr, error = %e, "Connection error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                tracing::debug!(peer_addr = %peer_addr, error = %e, "Connection error during drain");
            }
        }
    }
}
