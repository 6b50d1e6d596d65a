//! Direct delivery to external remote-write endpoints.
//!
//! # Responsibilities
//! - Build one HTTP client per destination from its TLS and auth settings
//! - Send already-encoded write bodies with the remote-write headers
//! - Classify the outcome: 2xx succeeds, anything else is a `DeliveryError`
//!
//! # Design Decisions
//! - No retries here; callers own retry policy
//! - Each send runs under the destination's timeout and is cancelled when
//!   it expires

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::schema::ExternalRemoteWriteConfig;
use crate::net::tls::build_client_config;
use crate::proxy::transport::{authorization_header, TransportError};

/// Upper bound on response bytes read for an error message.
const MAX_ERR_MSG_LEN: usize = 1024;

const REMOTE_WRITE_VERSION_HEADER: &str = "x-prometheus-remote-write-version";
const REMOTE_WRITE_VERSION: &str = "0.1.0";
const USER_AGENT_VALUE: &str = concat!("whizard-gateway/", env!("CARGO_PKG_VERSION"));

/// A failed delivery. `status` is `None` when no response arrived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DeliveryError {
    pub status: Option<StatusCode>,
    pub message: String,
}

impl DeliveryError {
    fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

/// Client for one external destination.
#[derive(Debug, Clone)]
pub struct RemoteWriteClient {
    name: String,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl RemoteWriteClient {
    pub fn new(config: &ExternalRemoteWriteConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| {
                TransportError::InvalidTarget {
                    target: config.name.clone(),
                    message: e.to_string(),
                }
            })?;
            headers.insert(name, HeaderValue::from_str(value)?);
        }
        if let Some(auth) =
            authorization_header(config.basic_auth.as_ref(), config.bearer_token.as_deref())?
        {
            headers.insert(AUTHORIZATION, auth);
        }

        let tls = build_client_config(&config.tls_config)?;
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .use_preconfigured_tls(tls)
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            timeout: config.remote_timeout,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver one encoded write request.
    pub async fn store(&self, body: Bytes) -> Result<(), DeliveryError> {
        let send = async {
            let response = self
                .client
                .post(&self.url)
                .header(CONTENT_ENCODING, "snappy")
                .header(CONTENT_TYPE, "application/x-protobuf")
                .header(USER_AGENT, USER_AGENT_VALUE)
                .header(REMOTE_WRITE_VERSION_HEADER, REMOTE_WRITE_VERSION)
                .body(body)
                .send()
                .await
                .map_err(|e| DeliveryError::transport(e.to_string()))?;
            check_response(response).await
        };

        match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::transport(format!(
                "request timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

async fn check_response(mut response: reqwest::Response) -> Result<(), DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let mut head = Vec::with_capacity(MAX_ERR_MSG_LEN);
    while head.len() < MAX_ERR_MSG_LEN {
        match response.chunk().await {
            Ok(Some(chunk)) => head.extend_from_slice(&chunk),
            _ => break,
        }
    }
    head.truncate(MAX_ERR_MSG_LEN);

    let text = String::from_utf8_lossy(&head);
    let line = text.lines().next().unwrap_or_default();
    Err(DeliveryError {
        status: Some(status),
        message: format!("server returned HTTP status {status}: {line}"),
    })
}
