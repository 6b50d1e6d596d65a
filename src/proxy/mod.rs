//! Reverse proxies towards the backends.
//!
//! # Data Flow
//! ```text
//! Inbound request
//!     → rewrite steps, in order
//!         1. StripTenantPrefix  (/tenant/api/v1/query → /api/v1/query)
//!         2. Target             (scheme, authority, base path)
//!     → header hygiene (hop-by-hop, Host, X-Forwarded-For)
//!     → Transport::round_trip
//!     → response with hop-by-hop headers removed
//! ```
//!
//! # Design Decisions
//! - Rewrite order is data, not closure nesting, and is asserted by tests
//! - Upstream failures map to 502, header timeouts to 504

pub mod transport;

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, Uri};
use url::Url;

use crate::error::GatewayError;

pub use transport::{parse_transport_configuration, Transport, TransportError};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe one connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// One outbound request mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteStep {
    /// Drop the first path segment.
    StripTenantPrefix,
    /// Point the request at the backend, prefixing its base path.
    Target {
        scheme: Scheme,
        authority: Authority,
        base_path: String,
    },
}

impl RewriteStep {
    /// Target step for a backend URL such as `http://query:9090/prefix`.
    pub fn target(url: &str) -> Result<Self, TransportError> {
        let invalid = |message: String| TransportError::InvalidTarget {
            target: url.to_string(),
            message,
        };
        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let authority = Authority::try_from(authority.as_str()).map_err(|e| invalid(e.to_string()))?;

        Ok(RewriteStep::Target {
            scheme,
            authority,
            base_path: parsed.path().trim_end_matches('/').to_string(),
        })
    }

    fn apply(&self, uri: &mut UriParts) {
        match self {
            RewriteStep::StripTenantPrefix => {
                uri.path = strip_tenant_prefix(&uri.path).to_string();
            }
            RewriteStep::Target {
                scheme,
                authority,
                base_path,
            } => {
                uri.scheme = Some(scheme.clone());
                uri.authority = Some(authority.clone());
                uri.path = join_path(base_path, &uri.path);
            }
        }
    }
}

/// Everything from the second `/` onward; unchanged when there is none.
pub fn strip_tenant_prefix(path: &str) -> &str {
    match path.get(1..).and_then(|rest| rest.find('/')) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

#[derive(Debug, Default)]
struct UriParts {
    scheme: Option<Scheme>,
    authority: Option<Authority>,
    path: String,
    query: Option<String>,
}

impl UriParts {
    fn from_uri(uri: &Uri) -> Self {
        Self {
            scheme: uri.scheme().cloned(),
            authority: uri.authority().cloned(),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
        }
    }

    fn into_uri(self) -> Result<Uri, GatewayError> {
        let path = if self.path.is_empty() { "/".to_string() } else { self.path };
        let path_and_query = match self.query {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };
        let path_and_query = PathAndQuery::try_from(path_and_query)
            .map_err(|e| GatewayError::Upstream(format!("invalid rewritten path: {e}")))?;

        let mut builder = Uri::builder().path_and_query(path_and_query);
        if let Some(scheme) = self.scheme {
            builder = builder.scheme(scheme);
        }
        if let Some(authority) = self.authority {
            builder = builder.authority(authority);
        }
        builder
            .build()
            .map_err(|e| GatewayError::Upstream(format!("invalid rewritten uri: {e}")))
    }
}

/// A reverse proxy bound to one backend.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    name: &'static str,
    steps: Vec<RewriteStep>,
    transport: Transport,
}

impl ReverseProxy {
    /// Proxy to `target`. With `strip_tenant` the tenant path segment is
    /// removed before the target is applied.
    pub fn new(
        name: &'static str,
        target: &str,
        transport: Transport,
        strip_tenant: bool,
    ) -> Result<Self, TransportError> {
        let mut steps = Vec::with_capacity(2);
        if strip_tenant {
            steps.push(RewriteStep::StripTenantPrefix);
        }
        steps.push(RewriteStep::target(target)?);

        tracing::info!(backend = name, target = %target, strip_tenant, "Reverse proxy configured");
        Ok(Self {
            name,
            steps,
            transport,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn steps(&self) -> &[RewriteStep] {
        &self.steps
    }

    /// Apply every rewrite step to `uri`, in order.
    pub fn rewrite_uri(&self, uri: &Uri) -> Result<Uri, GatewayError> {
        let mut parts = UriParts::from_uri(uri);
        for step in &self.steps {
            step.apply(&mut parts);
        }
        parts.into_uri()
    }

    /// Forward `req` and return the backend's response.
    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, GatewayError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self.rewrite_uri(&parts.uri)?;

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        prepare_request_headers(&mut parts.headers, peer);

        tracing::debug!(backend = self.name, uri = %parts.uri, "Forwarding request");
        let mut response = self
            .transport
            .round_trip(Request::from_parts(parts, body))
            .await
            .inspect_err(|e| {
                tracing::warn!(backend = self.name, error = %e, "Upstream request failed")
            })?;

        remove_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are connection-scoped too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn prepare_request_headers(headers: &mut HeaderMap, peer: Option<std::net::IpAddr>) {
    remove_hop_by_hop(headers);
    headers.remove(header::HOST);

    if let Some(ip) = peer {
        let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(target: &str, strip: bool) -> ReverseProxy {
        let transport = parse_transport_configuration(None, false).unwrap();
        ReverseProxy::new("query", target, transport, strip).unwrap()
    }

    #[test]
    fn strips_first_segment() {
        assert_eq!(strip_tenant_prefix("/tenantA/api/v1/series"), "/api/v1/series");
        assert_eq!(strip_tenant_prefix("/tenantA/"), "/");
        assert_eq!(strip_tenant_prefix("/tenantA"), "/tenantA");
        assert_eq!(strip_tenant_prefix("/"), "/");
        assert_eq!(strip_tenant_prefix(""), "");
    }

    #[test]
    fn joins_paths_with_single_slash() {
        assert_eq!(join_path("", "/api/v1/query"), "/api/v1/query");
        assert_eq!(join_path("/prefix", "/api"), "/prefix/api");
        assert_eq!(join_path("/prefix/", "/api"), "/prefix/api");
        assert_eq!(join_path("/prefix", "api"), "/prefix/api");
    }

    #[tokio::test]
    async fn steps_run_strip_then_target() {
        let proxy = proxy("http://query:9090", true);
        assert_eq!(proxy.steps()[0], RewriteStep::StripTenantPrefix);
        assert!(matches!(proxy.steps()[1], RewriteStep::Target { .. }));

        let uri: Uri = "/tenant1/api/v1/query?query=up".parse().unwrap();
        assert_eq!(
            proxy.rewrite_uri(&uri).unwrap().to_string(),
            "http://query:9090/api/v1/query?query=up"
        );
    }

    #[tokio::test]
    async fn target_base_path_is_kept() {
        let proxy = proxy("https://receive.example/prefix/", false);
        let uri: Uri = "/api/v1/receive".parse().unwrap();
        assert_eq!(
            proxy.rewrite_uri(&uri).unwrap().to_string(),
            "https://receive.example/prefix/api/v1/receive"
        );
    }

    #[test]
    fn rejects_unsupported_target() {
        assert!(RewriteStep::target("ftp://query").is_err());
        assert!(RewriteStep::target("not a url").is_err());
    }

    #[test]
    fn header_hygiene() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("snappy"));

        prepare_request_headers(&mut headers, Some("10.0.0.2".parse().unwrap()));

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-private").is_none());
        assert!(headers.get(header::TE).is_none());
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.1, 10.0.0.2");
        assert_eq!(headers[header::CONTENT_ENCODING], "snappy");
    }
}
