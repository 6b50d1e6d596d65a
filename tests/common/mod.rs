//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Router;
use tokio::net::TcpListener;

use whizard_gateway::config::GatewayConfig;
use whizard_gateway::lifecycle::{self, Shutdown};

/// One request as seen by a mock backend.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    /// Decoded values of query parameter `name`.
    pub fn query_values(&self, name: &str) -> Vec<String> {
        form_values(self.query.as_deref().unwrap_or_default().as_bytes(), name)
    }

    /// Decoded values of form field `name`.
    pub fn form_values(&self, name: &str) -> Vec<String> {
        form_values(&self.body, name)
    }
}

fn form_values(input: &[u8], name: &str) -> Vec<String> {
    url::form_urlencoded::parse(input)
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .collect()
}

#[derive(Clone)]
struct MockState {
    status: StatusCode,
    body: &'static str,
    delay: Duration,
    recorded: Arc<Mutex<Vec<Recorded>>>,
}

/// Backend that records every request and answers with a fixed response.
pub struct MockBackend {
    pub addr: SocketAddr,
    recorded: Arc<Mutex<Vec<Recorded>>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        Self::start_with(StatusCode::OK, "ok", Duration::ZERO).await
    }

    pub async fn start_with(status: StatusCode, body: &'static str, delay: Duration) -> Self {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            status,
            body,
            delay,
            recorded: recorded.clone(),
        };
        let app = Router::new().fallback(record).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, recorded }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.recorded.lock().unwrap().clone()
    }

    /// Wait until at least `count` requests arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<Recorded> {
        for _ in 0..100 {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("backend saw {} requests, expected {count}", self.requests().len());
    }
}

async fn record(State(state): State<MockState>, req: Request) -> (StatusCode, &'static str) {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    state.recorded.lock().unwrap().push(Recorded {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    });
    tokio::time::sleep(state.delay).await;
    (state.status, state.body)
}

/// Config bound to an ephemeral port with metrics off.
pub fn gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.observability.metrics_enabled = false;
    config
}

/// A running gateway; shut down on drop.
pub struct TestGateway {
    pub addr: SocketAddr,
    scheme: &'static str,
    shutdown: Shutdown,
}

impl TestGateway {
    pub async fn start(config: GatewayConfig) -> Self {
        Self::start_with_client(config, reqwest::Client::new()).await
    }

    /// Start and poll readiness through `client`, which must be able to
    /// reach the listener (https when TLS is configured).
    pub async fn start_with_client(config: GatewayConfig, client: reqwest::Client) -> Self {
        let scheme = if config.listener.tls.is_some() { "https" } else { "http" };
        let shutdown = Shutdown::new();
        let gateway = lifecycle::start(&config, &shutdown).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        tokio::spawn(gateway.run());

        let gateway = Self {
            addr,
            scheme,
            shutdown,
        };
        gateway.wait_ready(&client).await;
        gateway
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.addr, path)
    }

    async fn wait_ready(&self, client: &reqwest::Client) {
        for _ in 0..100 {
            if let Ok(res) = client.get(self.url("/-/ready")).send().await {
                if res.status().is_success() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("gateway did not become ready");
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
