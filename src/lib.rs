//! Multi-tenant gateway for a Prometheus-compatible metrics stack.

pub mod config;
pub mod enforce;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod remote_write;
pub mod tenant;

pub use config::schema::GatewayConfig;
pub use error::GatewayError;
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
