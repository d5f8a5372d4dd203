//! Initialization helpers for `.orchestrator/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{OrchestratorConfig, write_config};
use super::status_store::{idle_snapshot, write_status};

/// All canonical paths within `.orchestrator/` for a project root.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub orchestrator_dir: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub status_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let orchestrator_dir = root.join(".orchestrator");
        let state_dir = orchestrator_dir.join("state");
        Self {
            root: root.clone(),
            orchestrator_dir: orchestrator_dir.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: orchestrator_dir.join(".gitignore"),
            config_path: orchestrator_dir.join("config.toml"),
            status_path: state_dir.join("status.json"),
        }
    }
}

/// Options for `init_layout`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing orchestrator-owned files.
    pub force: bool,
}

/// Create `.orchestrator/` scaffolding in `root`.
///
/// Fails if `.orchestrator/` already exists unless `options.force` is set.
pub fn init_layout(root: &Path, options: &InitOptions) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    if paths.orchestrator_dir.exists() && !options.force {
        return Err(anyhow!(
            "orchestrator init: .orchestrator already exists (use --force to overwrite)"
        ));
    }
    if paths.orchestrator_dir.exists() && !paths.orchestrator_dir.is_dir() {
        return Err(anyhow!(
            "orchestrator init: .orchestrator exists but is not a directory"
        ));
    }

    let config = OrchestratorConfig::default();
    create_dir(&paths.orchestrator_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&config.bridge_dir(root))?;

    write_file(&paths.gitignore_path, ORCHESTRATOR_GITIGNORE)?;
    write_config(&paths.config_path, &config)?;
    write_status(&paths.status_path, &idle_snapshot(config.ui.show_logs))?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const ORCHESTRATOR_GITIGNORE: &str = "state/\nbridge/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::status_store::read_status;

    /// Verifies init_layout creates the directory structure and seed files.
    ///
    /// The config must load back as defaults and the status file must describe
    /// an idle orchestrator with no messages.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();

        let paths = init_layout(root, &InitOptions { force: false }).expect("init");

        assert!(paths.orchestrator_dir.is_dir());
        assert!(paths.state_dir.is_dir());
        assert!(root.join(".orchestrator/bridge").is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            ORCHESTRATOR_GITIGNORE
        );

        let config = load_config(&paths.config_path).expect("load config");
        assert_eq!(config, OrchestratorConfig::default());

        let status = read_status(&paths.status_path).expect("read status");
        assert!(!status.running);
        assert!(status.messages.is_empty());
    }

    /// Verifies init_layout refuses to overwrite without --force.
    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();

        init_layout(root, &InitOptions { force: false }).expect("init");
        let err = init_layout(root, &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    /// Verifies init_layout with --force restores a customized config.
    #[test]
    fn init_with_force_rewrites_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let paths = init_layout(root, &InitOptions { force: false }).expect("init");

        fs::write(&paths.config_path, "[ui]\nshow_logs = false\n").expect("write custom");
        init_layout(root, &InitOptions { force: true }).expect("re-init");

        let config = load_config(&paths.config_path).expect("load");
        assert!(config.ui.show_logs);
    }
}
