//! Configuration schema definitions.
//!
//! This module defines the complete settings structure for the gateway.
//! All types derive Serde traits for deserialization from TOML files.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_format;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, TLS, body limit).
    pub listener: ListenerConfig,

    /// How requests are attributed to tenants.
    pub tenant: TenantConfig,

    /// Backend targets behind the gateway.
    pub upstreams: UpstreamsConfig,

    /// Remote-write tagging and external fan-out.
    pub remote_write: RemoteWriteConfig,

    /// Tenant write admission list.
    pub admission: AdmissionConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9090").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Largest request body the gateway will buffer, in bytes.
    pub max_body_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
            tls: None,
            max_connections: 10_000,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// CA bundle used to verify client certificates. Setting it turns on
    /// mutual TLS and certificate authentication.
    #[serde(default)]
    pub client_ca_path: Option<String>,
}

/// Which request attribute identifies the tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TenantStrategy {
    /// First path segment, `/{tenant_id}/api/v1/...`.
    #[default]
    Path,
    /// A request header.
    Header,
    /// Common name of the verified client certificate.
    Certificate,
}

/// Tenant resolution and enforcement settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantConfig {
    pub strategy: TenantStrategy,

    /// Route parameter holding the tenant for the path strategy.
    pub path_param: String,

    /// Header holding the tenant for the header strategy.
    pub header: String,

    /// Label injected into every query selector.
    pub label: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            strategy: TenantStrategy::Path,
            path_param: "tenant_id".to_string(),
            header: "WHIZARD-TENANT".to_string(),
            label: "tenant_id".to_string(),
        }
    }
}

/// Backend targets. An absent target makes its endpoints answer 406.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UpstreamsConfig {
    /// Query engine (query, query_range, series, labels, label values).
    pub query: Option<String>,

    /// Rules backend; falls back to `query` when unset.
    pub rules: Option<String>,

    /// Remote-write ingestion backend.
    pub remote_write: Option<String>,

    /// YAML transport tuning for the query and rules backends.
    pub query_transport_config: Option<PathBuf>,

    /// YAML transport tuning for the remote-write backend.
    pub remote_write_transport_config: Option<PathBuf>,

    /// Skip certificate verification towards https backends that use the
    /// default transport.
    pub insecure_skip_verify: bool,
}

/// Remote-write settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteWriteConfig {
    /// Header set to the tenant id on every forwarded write.
    pub tenant_header: String,

    /// Destinations that receive a copy of every write.
    pub external: Vec<ExternalRemoteWriteConfig>,

    /// Writes whose copies may be in flight at once. Copies of further
    /// writes are skipped and counted as failed.
    pub max_concurrent_fanouts: usize,
}

impl Default for RemoteWriteConfig {
    fn default() -> Self {
        Self {
            tenant_header: "WHIZARD-TENANT".to_string(),
            external: Vec::new(),
            max_concurrent_fanouts: 256,
        }
    }
}

/// One external remote-write destination.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExternalRemoteWriteConfig {
    pub name: String,

    pub url: String,

    /// Static headers added to every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Deadline for one delivery.
    #[serde(
        default = "default_remote_timeout",
        deserialize_with = "duration_format::deserialize",
        serialize_with = "duration_format::serialize"
    )]
    pub remote_timeout: Duration,

    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,

    #[serde(default)]
    pub bearer_token: Option<String>,

    #[serde(default)]
    pub tls_config: ClientTlsConfig,
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Client-side TLS settings shared by backend transports and remote-write
/// destinations.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ClientTlsConfig {
    /// CA bundle used to verify the server. Public roots when unset.
    pub ca_file: Option<PathBuf>,

    /// Client certificate presented to the server.
    pub cert_file: Option<PathBuf>,

    /// Key for `cert_file`.
    pub key_file: Option<PathBuf>,

    pub insecure_skip_verify: bool,
}

impl ClientTlsConfig {
    pub fn is_empty(&self) -> bool {
        *self == ClientTlsConfig::default()
    }
}

/// Admission-control file settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub enabled: bool,

    /// JSON document `{"tenants": [...]}`.
    pub config_file: PathBuf,

    /// Fallback reload interval.
    #[serde(
        deserialize_with = "duration_format::deserialize",
        serialize_with = "duration_format::serialize"
    )]
    pub poll_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_file: PathBuf::new(),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 120 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9091".to_string(),
        }
    }
}
