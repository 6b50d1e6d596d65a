//! Tenant-tagged remote-write relay.
//!
//! # Data Flow
//! ```text
//! POST receive (tenant resolved, admitted)
//!     → set tenant header
//!     → ReverseProxy to the ingestion backend (body untouched)
//!     → when external destinations exist:
//!         buffer body once → background copy to each RemoteWriteClient
//! ```
//!
//! # Design Decisions
//! - The body and its Content-Encoding pass through byte for byte
//! - External deliveries never delay or fail the backend response; each
//!   failure is logged and counted
//! - At most `max_concurrent_fanouts` writes are copied at once; a write
//!   arriving while every slot is busy is not copied and counts as a
//!   failure for each destination

pub mod client;

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderName, HeaderValue, Request, Response};
use futures_util::future::join_all;
use tokio::sync::Semaphore;

use crate::error::GatewayError;
use crate::http::request::buffer_body;
use crate::observability::metrics;
use crate::proxy::ReverseProxy;
use crate::tenant::TenantContext;

pub use client::{DeliveryError, RemoteWriteClient};

/// Forwards writes for a tenant and fans copies out.
#[derive(Debug)]
pub struct RemoteWriteRelay {
    tenant_header: HeaderName,
    proxy: Option<ReverseProxy>,
    external: Arc<[RemoteWriteClient]>,
    max_body_size: usize,
    fanout_slots: Arc<Semaphore>,
}

impl RemoteWriteRelay {
    pub fn new(
        tenant_header: HeaderName,
        proxy: Option<ReverseProxy>,
        external: Vec<RemoteWriteClient>,
        max_body_size: usize,
        max_concurrent_fanouts: usize,
    ) -> Self {
        Self {
            tenant_header,
            proxy,
            external: external.into(),
            max_body_size,
            fanout_slots: Arc::new(Semaphore::new(max_concurrent_fanouts)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.proxy.is_some()
    }

    /// Tag `req` with the tenant and forward it to the ingestion backend.
    pub async fn relay(
        &self,
        tenant: &TenantContext,
        req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let proxy = self
            .proxy
            .as_ref()
            .ok_or(GatewayError::BackendUnconfigured("remote-write"))?;

        let value = HeaderValue::from_str(tenant.tenant_id()).map_err(|_| {
            tracing::debug!(tenant = %tenant.tenant_id(), "Tenant is not a valid header value");
            GatewayError::TenantNotFound
        })?;

        let (mut parts, body) = req.into_parts();
        parts.headers.insert(self.tenant_header.clone(), value);

        let body = if self.external.is_empty() {
            body
        } else {
            let bytes = buffer_body(body, self.max_body_size).await?;
            self.spawn_fan_out(tenant.tenant_id().to_string(), bytes.clone());
            Body::from(bytes)
        };

        proxy.forward(Request::from_parts(parts, body)).await
    }

    /// Copy `body` to every destination in the background. Returns false
    /// when no slot is free and the copy was skipped.
    fn spawn_fan_out(&self, tenant: String, body: Bytes) -> bool {
        let Ok(permit) = self.fanout_slots.clone().try_acquire_owned() else {
            tracing::warn!(tenant = %tenant, "Remote write fan-out saturated, copy skipped");
            for client in self.external.iter() {
                metrics::record_fanout(client.name(), false);
            }
            return false;
        };

        let external = self.external.clone();
        tokio::spawn(async move {
            let _permit = permit;
            for (name, result) in deliver_all(&external, body).await {
                match result {
                    Ok(()) => metrics::record_fanout(&name, true),
                    Err(e) => {
                        tracing::warn!(destination = %name, tenant = %tenant, error = %e, "Remote write delivery failed");
                        metrics::record_fanout(&name, false);
                    }
                }
            }
        });
        true
    }
}

/// Deliver `body` to every client concurrently.
pub async fn deliver_all(
    clients: &[RemoteWriteClient],
    body: Bytes,
) -> Vec<(String, Result<(), DeliveryError>)> {
    join_all(clients.iter().map(|client| {
        let body = body.clone();
        async move { (client.name().to_string(), client.store(body).await) }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ExternalRemoteWriteConfig;
    use std::time::Duration;

    fn relay(max_concurrent_fanouts: usize) -> RemoteWriteRelay {
        let destination = ExternalRemoteWriteConfig {
            name: "unreachable".into(),
            url: "http://127.0.0.1:1/api/v1/write".into(),
            headers: Default::default(),
            remote_timeout: Duration::from_secs(1),
            basic_auth: None,
            bearer_token: None,
            tls_config: Default::default(),
        };
        RemoteWriteRelay::new(
            HeaderName::from_static("whizard-tenant"),
            None,
            vec![RemoteWriteClient::new(&destination).unwrap()],
            1024,
            max_concurrent_fanouts,
        )
    }

    #[tokio::test]
    async fn fan_out_is_skipped_while_slots_are_busy() {
        let relay = relay(1);
        let body = Bytes::from_static(b"payload");

        assert!(relay.spawn_fan_out("tenant1".into(), body.clone()));
        assert!(!relay.spawn_fan_out("tenant1".into(), body.clone()));

        // The slot frees once the first copy has failed.
        let freed = tokio::time::timeout(Duration::from_secs(5), async {
            while !relay.spawn_fan_out("tenant1".into(), body.clone()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(freed.is_ok());
    }

    #[tokio::test]
    async fn relay_without_backend_is_unconfigured() {
        let relay = relay(1);
        let tenant = TenantContext::new("tenant1").unwrap();
        let req = Request::post("/api/v1/receive").body(Body::from("x")).unwrap();
        let err = relay.relay(&tenant, req).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnconfigured(_)));
    }
}
