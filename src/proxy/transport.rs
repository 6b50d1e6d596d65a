//! Downstream transport construction.
//!
//! # Data Flow
//! ```text
//! optional YAML bytes
//!     → DownstreamTripperConfig (serde_yaml)
//!     → TransportSettings (defaults + explicit overrides, or client block)
//!     → Transport (hyper-util pooled client over hyper-rustls)
//! ```
//!
//! # Design Decisions
//! - A non-empty `http_client_config` block builds the transport from that
//!   block alone; the tuning fields are then ignored
//! - Zero or absent tuning values never override a default
//! - Transports are built once at startup and shared read-only

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, Uri};
use base64::{engine::general_purpose::STANDARD, Engine};
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::Service;

use crate::config::duration_format;
use crate::config::schema::{BasicAuth, ClientTlsConfig};
use crate::error::GatewayError;
use crate::net::tls::{build_client_config, TlsError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to read transport config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse transport config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("invalid credentials: {0}")]
    Credentials(#[from] header::InvalidHeaderValue),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid proxy target {target}: {message}")]
    InvalidTarget { target: String, message: String },
}

/// Transport tuning document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DownstreamTripperConfig {
    #[serde(
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option"
    )]
    pub idle_conn_timeout: Option<Duration>,

    #[serde(
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option"
    )]
    pub response_header_timeout: Option<Duration>,

    #[serde(
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option"
    )]
    pub tls_handshake_timeout: Option<Duration>,

    /// Accepted for compatibility; hyper has no expect-continue client knob.
    #[serde(
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option"
    )]
    pub expect_continue_timeout: Option<Duration>,

    pub max_idle_conns_per_host: Option<usize>,

    pub max_conns_per_host: Option<usize>,

    pub http_client_config: Option<HttpClientConfig>,
}

/// Full client auth/TLS block.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub basic_auth: Option<BasicAuth>,
    pub bearer_token: Option<String>,
    pub tls_config: ClientTlsConfig,
}

impl HttpClientConfig {
    pub fn is_empty(&self) -> bool {
        self.basic_auth.is_none() && self.bearer_token.is_none() && self.tls_config.is_empty()
    }

    fn authorization(&self) -> Result<Option<HeaderValue>, TransportError> {
        authorization_header(self.basic_auth.as_ref(), self.bearer_token.as_deref())
    }
}

/// `Authorization` value for basic or bearer credentials.
pub fn authorization_header(
    basic: Option<&BasicAuth>,
    bearer: Option<&str>,
) -> Result<Option<HeaderValue>, TransportError> {
    let value = match (basic, bearer) {
        (Some(auth), _) => {
            let encoded = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
            format!("Basic {encoded}")
        }
        (None, Some(token)) => format!("Bearer {token}"),
        (None, None) => return Ok(None),
    };
    let mut value = HeaderValue::from_str(&value)?;
    value.set_sensitive(true);
    Ok(Some(value))
}

/// Effective transport parameters.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
    pub http2: bool,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub expect_continue_timeout: Duration,
    pub response_header_timeout: Option<Duration>,
    pub max_conns_per_host: Option<usize>,
    pub tls: ClientTlsConfig,
    pub authorization: Option<HeaderValue>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            http2: true,
            max_idle_conns_per_host: 100,
            idle_conn_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(10),
            expect_continue_timeout: Duration::from_secs(1),
            response_header_timeout: None,
            max_conns_per_host: None,
            tls: ClientTlsConfig::default(),
            authorization: None,
        }
    }
}

fn nonzero_duration(value: Option<Duration>) -> Option<Duration> {
    value.filter(|d| !d.is_zero())
}

fn nonzero(value: Option<usize>) -> Option<usize> {
    value.filter(|v| *v > 0)
}

impl TransportSettings {
    /// Resolve a parsed document against the defaults.
    pub fn resolve(config: DownstreamTripperConfig) -> Result<Self, TransportError> {
        let mut settings = TransportSettings::default();

        if let Some(client) = config.http_client_config.filter(|c| !c.is_empty()) {
            tracing::debug!("Building transport from http_client_config");
            settings.authorization = client.authorization()?;
            settings.tls = client.tls_config;
            return Ok(settings);
        }

        if let Some(v) = nonzero_duration(config.idle_conn_timeout) {
            settings.idle_conn_timeout = v;
        }
        if let Some(v) = nonzero_duration(config.tls_handshake_timeout) {
            settings.tls_handshake_timeout = v;
        }
        if let Some(v) = nonzero_duration(config.expect_continue_timeout) {
            settings.expect_continue_timeout = v;
        }
        if let Some(v) = nonzero(config.max_idle_conns_per_host) {
            settings.max_idle_conns_per_host = v;
        }
        settings.response_header_timeout = nonzero_duration(config.response_header_timeout);
        settings.max_conns_per_host = nonzero(config.max_conns_per_host);
        Ok(settings)
    }
}

/// Build a transport from optional YAML bytes.
///
/// `insecure_skip_verify` only applies when no document is supplied.
pub fn parse_transport_configuration(
    content: Option<&[u8]>,
    insecure_skip_verify: bool,
) -> Result<Transport, TransportError> {
    let settings = match content.filter(|c| !c.iter().all(u8::is_ascii_whitespace)) {
        Some(content) => {
            let config: DownstreamTripperConfig = serde_yaml::from_slice(content)?;
            TransportSettings::resolve(config)?
        }
        None => TransportSettings {
            tls: ClientTlsConfig {
                insecure_skip_verify,
                ..Default::default()
            },
            ..Default::default()
        },
    };
    Transport::new(settings)
}

/// Read the YAML file at `path`, if any, and build a transport.
pub fn load_transport(
    path: Option<&std::path::Path>,
    insecure_skip_verify: bool,
) -> Result<Transport, TransportError> {
    let content = path
        .map(|p| {
            std::fs::read(p).map_err(|source| TransportError::Read {
                path: p.display().to_string(),
                source,
            })
        })
        .transpose()?;
    parse_transport_configuration(content.as_deref(), insecure_skip_verify)
}

type HttpsClient = Client<TimeoutConnector<hyper_rustls::HttpsConnector<HttpConnector>>, Body>;

/// Pooled HTTP client towards one backend.
#[derive(Clone)]
pub struct Transport {
    client: HttpsClient,
    response_header_timeout: Option<Duration>,
    conn_limit: Option<Arc<Semaphore>>,
    authorization: Option<HeaderValue>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("response_header_timeout", &self.response_header_timeout)
            .field("conn_limit", &self.conn_limit.as_ref().map(|s| s.available_permits()))
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(settings: TransportSettings) -> Result<Self, TransportError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(settings.dial_timeout));
        http.set_keepalive(Some(settings.keep_alive));

        let tls = build_client_config(&settings.tls)?;
        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http();
        let https = if settings.http2 {
            builder.enable_all_versions().wrap_connector(http)
        } else {
            builder.enable_http1().wrap_connector(http)
        };
        let connector = TimeoutConnector {
            inner: https,
            timeout: settings.dial_timeout + settings.tls_handshake_timeout,
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(settings.idle_conn_timeout)
            .pool_max_idle_per_host(settings.max_idle_conns_per_host)
            .build(connector);

        Ok(Self {
            client,
            response_header_timeout: settings.response_header_timeout,
            conn_limit: settings
                .max_conns_per_host
                .map(|n| Arc::new(Semaphore::new(n))),
            authorization: settings.authorization,
        })
    }

    /// Send `req` and wait for the response head.
    ///
    /// The connection slot, when limited, is held until the response body
    /// is dropped.
    pub async fn round_trip(&self, mut req: Request<Body>) -> Result<Response<Body>, GatewayError> {
        let permit = match &self.conn_limit {
            Some(limit) => Some(
                limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| GatewayError::Upstream(e.to_string()))?,
            ),
            None => None,
        };

        if let Some(auth) = &self.authorization {
            if !req.headers().contains_key(header::AUTHORIZATION) {
                req.headers_mut().insert(header::AUTHORIZATION, auth.clone());
            }
        }

        let pending = self.client.request(req);
        let result = match self.response_header_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| GatewayError::UpstreamTimeout)?,
            None => pending.await,
        };
        let response = result.map_err(|e| GatewayError::Upstream(e.to_string()))?;

        Ok(response.map(|body| {
            Body::new(PermitBody {
                inner: body,
                _permit: permit,
            })
        }))
    }
}

/// Response body that releases its connection slot when dropped.
struct PermitBody {
    inner: Incoming,
    _permit: Option<OwnedSemaphorePermit>,
}

impl HttpBody for PermitBody {
    type Data = bytes::Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[derive(Debug, Error)]
#[error("connect timed out after {0:?}")]
struct ConnectTimeout(Duration);

/// Bounds connection establishment, including the TLS handshake.
#[derive(Debug, Clone)]
pub struct TimeoutConnector<C> {
    inner: C,
    timeout: Duration,
}

impl<C> Service<Uri> for TimeoutConnector<C>
where
    C: Service<Uri>,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<C::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let timeout = self.timeout;
        let connecting = self.inner.call(uri);
        Box::pin(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(ConnectTimeout(timeout)) as BoxError),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(yaml: &str) -> TransportSettings {
        let config: DownstreamTripperConfig = serde_yaml::from_str(yaml).unwrap();
        TransportSettings::resolve(config).unwrap()
    }

    #[test]
    fn defaults_without_document() {
        let settings = TransportSettings::default();
        assert_eq!(settings.dial_timeout, Duration::from_secs(30));
        assert_eq!(settings.keep_alive, Duration::from_secs(30));
        assert!(settings.http2);
        assert_eq!(settings.max_idle_conns_per_host, 100);
        assert_eq!(settings.idle_conn_timeout, Duration::from_secs(90));
        assert_eq!(settings.tls_handshake_timeout, Duration::from_secs(10));
        assert_eq!(settings.expect_continue_timeout, Duration::from_secs(1));
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let settings = resolve(
            "idle_conn_timeout: 2m\nresponse_header_timeout: 5s\nmax_conns_per_host: 8\n",
        );
        assert_eq!(settings.idle_conn_timeout, Duration::from_secs(120));
        assert_eq!(settings.response_header_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.max_conns_per_host, Some(8));
        assert_eq!(settings.tls_handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn zero_values_keep_defaults() {
        let settings = resolve("idle_conn_timeout: 0s\nmax_idle_conns_per_host: 0\n");
        assert_eq!(settings.idle_conn_timeout, Duration::from_secs(90));
        assert_eq!(settings.max_idle_conns_per_host, 100);
        assert_eq!(settings.max_conns_per_host, None);
    }

    #[test]
    fn client_block_replaces_tuning() {
        let settings = resolve(
            "idle_conn_timeout: 2m\nhttp_client_config:\n  bearer_token: secret\n",
        );
        assert_eq!(settings.idle_conn_timeout, Duration::from_secs(90));
        assert_eq!(
            settings.authorization.unwrap().to_str().unwrap(),
            "Bearer secret"
        );
    }

    #[test]
    fn empty_client_block_is_ignored() {
        let settings = resolve("idle_conn_timeout: 2m\nhttp_client_config: {}\n");
        assert_eq!(settings.idle_conn_timeout, Duration::from_secs(120));
    }

    #[test]
    fn basic_auth_header() {
        let auth = BasicAuth {
            username: "user".into(),
            password: "pass".into(),
        };
        let value = authorization_header(Some(&auth), None).unwrap().unwrap();
        assert_eq!(value.to_str().unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let err = parse_transport_configuration(Some(b"idle_conn_timeout: [1"), false).unwrap_err();
        assert!(matches!(err, TransportError::Parse(_)));
    }

    #[tokio::test]
    async fn builds_transport_from_yaml() {
        let transport =
            parse_transport_configuration(Some(b"max_conns_per_host: 2\n"), false).unwrap();
        assert!(transport.conn_limit.is_some());
        assert!(parse_transport_configuration(None, true).is_ok());
    }
}
