//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (net::listener)
//!     → server.rs (router, request ID, trace, timeout)
//!     → tenant resolution / certificate authorization
//!     → handlers.rs (enforce tenant scope or relay writes)
//!     → proxy::ReverseProxy
//!     → response.rs (metrics, error rendering)
//! ```

pub mod handlers;
pub mod request;
pub mod response;
pub mod server;

pub use request::{MakeRequestUuidV4, X_REQUEST_ID};
pub use server::{build_router, AppState, GatewayServer, RouterOptions};
