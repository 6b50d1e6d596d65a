//! Tenant write admission list.
//!
//! # Responsibilities
//! - Read and parse the `{"tenants": [...]}` document
//! - Hash file contents for change detection
//! - Hold the active list behind an atomic pointer swap
//! - Apply updates from the watcher channel in arrival order
//!
//! # Design Decisions
//! - The active list is replaced wholesale, never edited in place
//! - A single consumer task performs every swap, so updates are applied
//!   strictly in detection order
//! - Readers load a snapshot without locking

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The set of tenants allowed to write through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct AdmissionControlConfig {
    #[serde(default)]
    pub tenants: Vec<String>,
}

impl AdmissionControlConfig {
    pub fn allows(&self, tenant: &str) -> bool {
        self.tenants.iter().any(|t| t == tenant)
    }
}

/// Failure to load the admission file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read admission config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse admission config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse file contents. Blank content is an empty tenant list.
pub fn parse_admission_config(
    path: &Path,
    content: &[u8],
) -> Result<AdmissionControlConfig, ConfigFileError> {
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(AdmissionControlConfig::default());
    }

    serde_json::from_slice(content).map_err(|source| ConfigFileError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Read the file fully and return its bytes alongside the parsed document.
pub fn read_admission_config(
    path: &Path,
) -> Result<(Vec<u8>, AdmissionControlConfig), ConfigFileError> {
    let content = fs::read(path).map_err(|source| ConfigFileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config = parse_admission_config(path, &content)?;
    Ok((content, config))
}

/// MD5 of `content` truncated to its first 48 bits.
///
/// Returned as `f64` so it can be exported as a gauge without conversion;
/// 48 bits fit exactly in an f64 mantissa.
pub fn config_hash(content: &[u8]) -> f64 {
    let digest = Md5::digest(content);
    let truncated = digest[..6]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    truncated as f64
}

/// Holder of the active admission list.
#[derive(Debug)]
pub struct AdmissionControl {
    current: ArcSwap<AdmissionControlConfig>,
}

impl AdmissionControl {
    pub fn new(initial: AdmissionControlConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Snapshot of the active list.
    pub fn current(&self) -> Arc<AdmissionControlConfig> {
        self.current.load_full()
    }

    pub fn is_admitted(&self, tenant: &str) -> bool {
        self.current.load().allows(tenant)
    }

    /// Replace the active list.
    pub fn apply(&self, config: AdmissionControlConfig) {
        tracing::info!(tenants = config.tenants.len(), "Admission config applied");
        self.current.store(Arc::new(config));
    }

    /// Apply every update from `updates` until the channel closes.
    pub fn spawn_consumer(
        self: Arc<Self>,
        mut updates: mpsc::Receiver<AdmissionControlConfig>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                self.apply(config);
            }
            tracing::debug!("Admission config channel closed");
        })
    }
}
