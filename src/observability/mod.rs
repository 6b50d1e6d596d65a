//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! handlers, proxy, relay, watcher
//!     → logging.rs (tracing subscriber, text or JSON to stdout)
//!     → metrics.rs (request, admission and fan-out series)
//!         → Prometheus exporter on its own listener
//! ```
//!
//! Tenant ids appear in log fields but never as metric labels.

pub mod logging;
pub mod metrics;
