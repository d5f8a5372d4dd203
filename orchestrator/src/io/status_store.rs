//! Status snapshot storage (`.orchestrator/state/status.json`).
//!
//! The orchestrator publishes each snapshot to its observers; the file sink is
//! the one external readers (the UI server, `orchestrator status`) consume.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::{StatusSnapshot, TaskStatus};

/// Receives every published status snapshot.
pub trait StatusObserver: Send {
    fn status_changed(&mut self, snapshot: &StatusSnapshot) -> Result<()>;
}

/// Writes snapshots to a JSON file, replacing it atomically.
#[derive(Debug, Clone)]
pub struct StatusFileSink {
    path: PathBuf,
}

impl StatusFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusObserver for StatusFileSink {
    fn status_changed(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        write_status(&self.path, snapshot)
    }
}

/// Snapshot of an orchestrator with no session and no task.
pub fn idle_snapshot(show_logs: bool) -> StatusSnapshot {
    StatusSnapshot {
        state: TaskStatus::Idle,
        task: None,
        running: false,
        status_line: "Idle".to_string(),
        show_logs,
        session: None,
        messages: Vec::new(),
    }
}

pub fn read_status(path: &Path) -> Result<StatusSnapshot> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read status {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse status {}", path.display()))
}

/// Atomically write a snapshot to disk (temp file + rename).
pub fn write_status(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    debug!(
        path = %path.display(),
        state = snapshot.state.label(),
        messages = snapshot.messages.len(),
        "writing status"
    );
    let mut buf = serde_json::to_string_pretty(snapshot)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("status path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp status {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace status {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{LogMessage, MessageKind, SessionId};

    /// Verifies the sink overwrites the file with the latest snapshot.
    #[test]
    fn sink_writes_latest_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut sink = StatusFileSink::new(temp.path().join("state/status.json"));

        sink.status_changed(&idle_snapshot(true)).expect("first");
        let running = StatusSnapshot {
            state: TaskStatus::Running,
            task: Some("open settings".to_string()),
            running: true,
            status_line: "Running: open settings".to_string(),
            show_logs: true,
            session: Some(SessionId(3)),
            messages: vec![LogMessage {
                kind: MessageKind::User,
                text: "open settings".to_string(),
                timestamp: 42,
            }],
        };
        sink.status_changed(&running).expect("second");

        assert_eq!(read_status(sink.path()).expect("read"), running);
        assert!(!temp.path().join("state/status.json.tmp").exists());
    }

    /// Keeps the on-disk field names stable for external readers.
    #[test]
    fn idle_snapshot_serializes_stably() {
        let json = serde_json::to_string(&idle_snapshot(false)).expect("serialize");
        assert_eq!(
            json,
            r#"{"state":"idle","task":null,"running":false,"status_line":"Idle","show_logs":false,"session":null,"messages":[]}"#
        );
    }
}
