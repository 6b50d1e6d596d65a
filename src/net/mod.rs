//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limit)
//!     → tls.rs (optional TLS handshake, client certificates)
//!     → hyper connection serving the router
//! ```
//!
//! # Design Decisions
//! - Bounded connection count prevents resource exhaustion
//! - Each connection is tracked for graceful shutdown
//! - TLS is optional; peer certificates ride along as a request extension

pub mod listener;
pub mod tls;
