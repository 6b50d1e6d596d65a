//! Admission file watcher for hot reload.
//!
//! # Lifecycle
//! ```text
//! Created  → filesystem watch established (fails fast otherwise)
//! Running  → select over { fs event, poll tick, cancellation }
//!            every trigger: read → parse → hash → emit if hash changed
//! Stopped  → drain fs events → close watch handle → close output channel
//! ```
//!
//! # Design Decisions
//! - The poll tick is a fallback for missed or coalesced fs events
//! - Identical content is never delivered twice (hash dedup)
//! - Reload failures keep the previous list active and are only logged and
//!   counted
//! - Channel sends race against cancellation so shutdown never blocks on a
//!   receiver that stopped reading

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::admission::{
    config_hash, read_admission_config, AdmissionControlConfig, ConfigFileError,
};
use crate::observability::metrics;

/// Buffered fs events between the notify thread and the run loop.
const EVENT_BUFFER: usize = 64;

/// Upper bound on waiting for the notify thread to release its handler.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: String,
        #[source]
        source: notify::Error,
    },
}

/// Watches the admission file and publishes every distinct version of it.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    last_hash: Option<f64>,
    updates: mpsc::Sender<AdmissionControlConfig>,
    watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
}

impl ConfigWatcher {
    /// Establish the filesystem watch on `path`.
    ///
    /// Returns the watcher and the receiver for configuration updates.
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Result<(Self, mpsc::Receiver<AdmissionControlConfig>), WatchError> {
        let path = path.into();
        let watch_error = |source| WatchError::Watch {
            path: path.display().to_string(),
            source,
        };

        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // Runs on the notify thread, never inside the runtime.
                let _ = event_tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .map_err(watch_error)?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;

        let (updates, update_rx) = mpsc::channel(1);

        tracing::info!(path = %path.display(), interval = ?poll_interval, "Admission config watcher created");
        Ok((
            Self {
                path,
                poll_interval,
                last_hash: None,
                updates,
                watcher,
                events,
            },
            update_rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file once, without touching dedup state.
    ///
    /// Call before [`ConfigWatcher::run`] so a malformed file fails startup.
    pub fn validate_config(&self) -> Result<AdmissionControlConfig, ConfigFileError> {
        read_admission_config(&self.path).map(|(_, config)| config)
    }

    /// Spawn [`ConfigWatcher::run`] on the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run until `cancel` fires, then shut down in order.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let keep_running = tokio::select! {
                _ = cancel.cancelled() => false,
                event = self.events.recv() => match event {
                    Some(Ok(event)) if needs_reload(&event) => {
                        tracing::debug!(kind = ?event.kind, "Admission config file changed");
                        metrics::record_admission_file_change();
                        self.reload(&cancel).await
                    }
                    Some(Ok(_)) => true,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Admission config watch error");
                        metrics::record_admission_reload(false);
                        true
                    }
                    None => {
                        tracing::warn!("Admission config watch stream ended");
                        false
                    }
                },
                _ = ticker.tick() => {
                    metrics::record_admission_refresh();
                    self.reload(&cancel).await
                }
            };

            if !keep_running {
                break;
            }
        }

        self.stop().await;
    }

    /// Returns `false` when cancelled while delivering.
    async fn reload(&mut self, cancel: &CancellationToken) -> bool {
        let (content, config) = match read_admission_config(&self.path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload admission config. Keeping current configuration.");
                metrics::record_admission_reload(false);
                return true;
            }
        };
        metrics::record_admission_reload(true);

        let hash = config_hash(&content);
        if self.last_hash == Some(hash) {
            return true;
        }

        let tenants = config.tenants.len();
        let delivered = tokio::select! {
            res = self.updates.send(config) => res.is_ok(),
            _ = cancel.cancelled() => return false,
        };

        if delivered {
            self.last_hash = Some(hash);
            metrics::record_admission_config(hash, tenants);
            tracing::info!(tenants, hash, "Admission config reloaded");
        } else {
            tracing::debug!("Admission config receiver dropped");
        }
        true
    }

    async fn stop(self) {
        let ConfigWatcher {
            path,
            updates,
            watcher,
            mut events,
            ..
        } = self;

        // The notify thread may be parked in `blocking_send`; keep consuming
        // until it releases its sender, or closing the watch never completes.
        let drain = tokio::spawn(async move {
            let mut discarded = 0usize;
            while events.recv().await.is_some() {
                discarded += 1;
            }
            discarded
        });

        if let Err(e) = tokio::task::spawn_blocking(move || drop(watcher)).await {
            tracing::warn!(error = %e, "Closing admission config watch failed");
        }

        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(Ok(discarded)) => tracing::debug!(discarded, "Drained pending watch events"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Watch event drain task failed"),
            Err(_) => tracing::warn!("Timed out draining watch events"),
        }

        drop(updates);
        tracing::info!(path = %path.display(), "Admission config watcher stopped");
    }
}

/// Whether a filesystem event should trigger a reload.
///
/// Permission-only changes, deletions, reads and name-less events do not.
pub fn needs_reload(event: &Event) -> bool {
    if event.paths.is_empty() {
        return false;
    }
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) => false,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Remove(_) => false,
        _ => true,
    }
}
