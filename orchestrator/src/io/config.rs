//! Orchestrator configuration stored under `.orchestrator/config.toml`.
//!
//! Configuration is an explicit value owned by whoever constructs the
//! orchestrator. Components that care about changes register with the
//! [`ConfigStore`] instead of reading shared global state.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::classifier::{DEFAULT_GRACE_MS, PhraseContract};
use crate::core::script::{AgentInvocation, is_valid_env_key};

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to working values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub session: SessionConfig,
    pub agent: AgentConfig,
    pub classifier: ClassifierConfig,
    pub bridge: BridgeConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell program hosting the agent.
    pub shell: String,
    pub shell_args: Vec<String>,
    /// Working directory; relative paths resolve against the project root.
    pub workdir: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub cell_width_px: u16,
    pub cell_height_px: u16,
    /// Oldest transcript text is dropped beyond this many bytes.
    pub transcript_limit_bytes: usize,
    /// Interval at which the coordinating loop re-evaluates the running task.
    pub tick_interval_ms: u64,
    /// Upper bound on waiting for a finished session to exit during teardown.
    pub teardown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            shell_args: vec!["-i".to_string()],
            workdir: PathBuf::from("."),
            cols: 80,
            rows: 24,
            cell_width_px: 8,
            cell_height_px: 16,
            transcript_limit_bytes: 256_000,
            tick_interval_ms: 250,
            teardown_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub binary: String,
    pub subcommand: String,
    /// Tool that manages the loopback device bridge.
    pub bridge_tool: String,
    pub bridge_address: String,
    /// Extra variables exported into the session during setup.
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "droidrun".to_string(),
            subcommand: "run".to_string(),
            bridge_tool: "adb".to_string(),
            bridge_address: "127.0.0.1:5555".to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn invocation(&self) -> AgentInvocation<'_> {
        AgentInvocation {
            binary: &self.binary,
            subcommand: &self.subcommand,
            bridge_address: &self.bridge_address,
            bridge_tool: &self.bridge_tool,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Prompt returns within this many milliseconds of task start are ignored.
    pub grace_ms: u64,
    pub phrases: PhraseContract,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            grace_ms: DEFAULT_GRACE_MS,
            phrases: PhraseContract::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Mailbox directory; relative paths resolve against the project root.
    pub dir: PathBuf,
    pub poll_interval_ms: u64,
    /// JSON file produced by the accessibility collaborator, if any.
    pub device_state_source: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".orchestrator/bridge"),
            poll_interval_ms: 100,
            device_state_source: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiConfig {
    pub show_logs: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { show_logs: true }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session.shell.trim().is_empty() {
            return Err(anyhow!("session.shell must be non-empty"));
        }
        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(anyhow!("session.cols and session.rows must be > 0"));
        }
        if self.session.transcript_limit_bytes == 0 {
            return Err(anyhow!("session.transcript_limit_bytes must be > 0"));
        }
        if self.session.tick_interval_ms == 0 {
            return Err(anyhow!("session.tick_interval_ms must be > 0"));
        }
        if self.agent.binary.trim().is_empty() {
            return Err(anyhow!("agent.binary must be non-empty"));
        }
        if let Some(key) = self.agent.env.keys().find(|key| !is_valid_env_key(key)) {
            return Err(anyhow!("agent.env key '{key}' is not a valid variable name"));
        }
        if self.bridge.poll_interval_ms == 0 {
            return Err(anyhow!("bridge.poll_interval_ms must be > 0"));
        }
        self.classifier.phrases.validate().map_err(|err| anyhow!(err))?;
        Ok(())
    }

    /// Session working directory resolved against `root`.
    pub fn session_workdir(&self, root: &Path) -> PathBuf {
        resolve(root, &self.session.workdir)
    }

    /// Mailbox directory resolved against `root`.
    pub fn bridge_dir(&self, root: &Path) -> PathBuf {
        resolve(root, &self.bridge.dir)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Receives the new configuration after every accepted change.
pub trait ConfigObserver: Send {
    fn config_changed(&mut self, config: &OrchestratorConfig);
}

impl<F> ConfigObserver for F
where
    F: FnMut(&OrchestratorConfig) + Send,
{
    fn config_changed(&mut self, config: &OrchestratorConfig) {
        self(config);
    }
}

/// Owned configuration plus the observers to notify when it changes.
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: OrchestratorConfig,
    observers: Vec<Box<dyn ConfigObserver>>,
}

impl ConfigStore {
    /// In-memory store; changes are not persisted.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            path: None,
            config,
            observers: Vec::new(),
        }
    }

    /// Store backed by `path`; accepted changes are written back atomically.
    pub fn open(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            config,
            observers: Vec::new(),
        })
    }

    pub fn get(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn subscribe(&mut self, observer: impl ConfigObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Apply `change`, validate, persist, then notify observers.
    ///
    /// Returns `Ok(false)` when the change left the configuration untouched.
    pub fn update(&mut self, change: impl FnOnce(&mut OrchestratorConfig)) -> Result<bool> {
        let mut next = self.config.clone();
        change(&mut next);
        if next == self.config {
            return Ok(false);
        }
        next.validate()?;
        if let Some(path) = &self.path {
            write_config(path, &next)?;
        }
        self.config = next;
        info!(observers = self.observers.len(), "config updated");
        for observer in &mut self.observers {
            observer.config_changed(&self.config);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = OrchestratorConfig::default();
        cfg.agent
            .env
            .insert("GOOGLE_REGION".to_string(), "eu".to_string());
        cfg.bridge.device_state_source = Some(PathBuf::from("/tmp/a11y.json"));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[classifier]\ngrace_ms = 5000\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.classifier.grace_ms, 5_000);
        assert_eq!(cfg.classifier.phrases, PhraseContract::default());
        assert_eq!(cfg.session, SessionConfig::default());
    }

    #[test]
    fn rejects_invalid_env_key() {
        let mut cfg = OrchestratorConfig::default();
        cfg.agent.env.insert("BAD-KEY".to_string(), "x".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("BAD-KEY"));
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let cfg = OrchestratorConfig::default();
        let root = Path::new("/work");
        assert_eq!(cfg.bridge_dir(root), PathBuf::from("/work/.orchestrator/bridge"));
        assert_eq!(cfg.session_workdir(root), PathBuf::from("/work/."));
    }

    #[test]
    fn store_notifies_observers_and_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut store = ConfigStore::open(&path).expect("open");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(move |cfg: &OrchestratorConfig| {
            sink.lock().expect("lock").push(cfg.ui.show_logs);
        });

        assert!(store.update(|cfg| cfg.ui.show_logs = false).expect("update"));
        assert!(!store.update(|cfg| cfg.ui.show_logs = false).expect("no-op"));

        assert_eq!(*seen.lock().expect("lock"), vec![false]);
        assert!(!load_config(&path).expect("reload").ui.show_logs);
    }

    #[test]
    fn store_rejects_invalid_change_without_notifying() {
        let mut store = ConfigStore::new(OrchestratorConfig::default());
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        store.subscribe(move |_: &OrchestratorConfig| *counter.lock().expect("lock") += 1);

        assert!(store.update(|cfg| cfg.session.cols = 0).is_err());
        assert_eq!(store.get().session.cols, 80);
        assert_eq!(*calls.lock().expect("lock"), 0);
    }
}
