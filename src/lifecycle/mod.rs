//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → transports, proxies, relay → admission watcher
//!     → TLS acceptor → bind listener
//!
//! Shutdown (shutdown.rs):
//!     SIGTERM/SIGINT → cancel token → readiness off → stop accepting
//!     → drain connections → watcher stops → exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: backends first, listener last
//! - Shutdown has timeout: in-flight connections get a bounded drain

pub mod shutdown;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{start, Gateway, StartupError};
