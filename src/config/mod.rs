//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! gateway.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! admission.json (hot reloaded)
//!     watcher.rs detects change or poll tick
//!     → admission.rs parses + hashes
//!     → channel → AdmissionControl consumer
//!     → atomic swap of Arc<AdmissionControlConfig>
//! ```
//!
//! # Design Decisions
//! - Gateway config is immutable once loaded; only the admission list reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod admission;
pub mod duration_format;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use admission::{AdmissionControl, AdmissionControlConfig};
pub use loader::{default_config, load_config, ConfigError};
pub use schema::{GatewayConfig, TenantStrategy};
pub use watcher::ConfigWatcher;
