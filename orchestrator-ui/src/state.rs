//! Shared application state for the UI server.

use std::path::PathBuf;
use std::sync::Arc;

use orchestrator::io::config::load_config;
use orchestrator::io::init::OrchestratorPaths;
use tokio::sync::broadcast;
use tracing::warn;

/// Events broadcast to SSE clients when files change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    StatusChanged,
    ConfigChanged,
    DeviceStateChanged,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub paths: OrchestratorPaths,
    /// Broadcast sender for file change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(project_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            paths: OrchestratorPaths::new(project_dir),
            event_tx: Arc::new(event_tx),
        }
    }

    /// Bridge directory named by the current config, defaults when unreadable.
    pub fn bridge_dir(&self) -> PathBuf {
        match load_config(&self.paths.config_path) {
            Ok(config) => config.bridge_dir(&self.paths.root),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "config unreadable; using default bridge dir");
                orchestrator::io::config::OrchestratorConfig::default().bridge_dir(&self.paths.root)
            }
        }
    }
}
