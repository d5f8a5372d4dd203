//! File mailbox shared with the agent process.
//!
//! Three single-slot records live in one directory:
//! - `device_state.json`: written by us, read (not consumed) by the agent.
//! - `python_actions.json`: written by the agent, consumed by us.
//! - `action_result.json`: written by us, consumed by the agent.
//!
//! A record's presence is the "message available" signal and a successful read
//! deletes it, so delivery is at most once. Every operation holds the bridge
//! lock exclusively. Writes go through temp file + rename so the other process
//! never observes a half-written record.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

pub const DEVICE_STATE_FILE: &str = "device_state.json";
pub const ACTIONS_FILE: &str = "python_actions.json";
pub const RESULT_FILE: &str = "action_result.json";

/// Environment variables through which the agent learns the mailbox paths.
pub const STATE_FILE_ENV: &str = "DROIDRUN_STATE_FILE";
pub const ACTIONS_FILE_ENV: &str = "DROIDRUN_ACTIONS_FILE";
pub const RESULT_FILE_ENV: &str = "DROIDRUN_RESULT_FILE";

const FOCUSED_TEXT_LOG_CHARS: usize = 50;

/// Snapshot of the device as seen by the automation collaborator.
///
/// The tree and phone state are carried as JSON-encoded strings, not nested
/// objects; the agent decodes them itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub formatted_text: String,
    pub focused_text: String,
    pub a11y_tree_json: String,
    pub phone_state_json: String,
    pub timestamp: i64,
}

impl DeviceState {
    pub fn new(
        formatted_text: impl Into<String>,
        focused_text: impl Into<String>,
        element_tree: &Value,
        phone_state: &Value,
        timestamp: i64,
    ) -> Self {
        Self {
            formatted_text: formatted_text.into(),
            focused_text: focused_text.into(),
            a11y_tree_json: element_tree.to_string(),
            phone_state_json: phone_state.to_string(),
            timestamp,
        }
    }

    pub fn element_tree(&self) -> Result<Value> {
        serde_json::from_str(&self.a11y_tree_json).context("decode a11y tree")
    }

    pub fn phone_state(&self) -> Result<Value> {
        serde_json::from_str(&self.phone_state_json).context("decode phone state")
    }

    /// Number of nodes in the element tree, counting nested `children`.
    pub fn element_count(&self) -> usize {
        self.element_tree().map(|tree| count_elements(&tree)).unwrap_or(0)
    }
}

/// An action the agent asks us to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub action_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub timestamp: i64,
    pub action_id: String,
}

impl PendingAction {
    pub fn new(action_type: impl Into<String>, parameters: BTreeMap<String, String>, now_ms: i64) -> Self {
        Self {
            action_type: action_type.into(),
            parameters,
            timestamp: now_ms,
            action_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// Outcome of a [`PendingAction`], addressed by its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action_id: String,
    pub success: bool,
    pub result: String,
    pub error: Option<String>,
    pub timestamp: i64,
}

impl ActionResult {
    pub fn ok(action_id: impl Into<String>, result: impl Into<String>, now_ms: i64) -> Self {
        Self {
            action_id: action_id.into(),
            success: true,
            result: result.into(),
            error: None,
            timestamp: now_ms,
        }
    }

    pub fn failed(action_id: impl Into<String>, error: impl Into<String>, now_ms: i64) -> Self {
        Self {
            action_id: action_id.into(),
            success: false,
            result: String::new(),
            error: Some(error.into()),
            timestamp: now_ms,
        }
    }
}

/// Corrupt records already warned about, with the modification time seen.
type ReportedCorrupt = BTreeMap<PathBuf, Option<SystemTime>>;

/// The three mailbox records under one directory, guarded by one lock.
#[derive(Debug)]
pub struct AgentBridge {
    dir: PathBuf,
    lock: RwLock<ReportedCorrupt>,
}

impl AgentBridge {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn device_state_path(&self) -> PathBuf {
        self.dir.join(DEVICE_STATE_FILE)
    }

    pub fn actions_path(&self) -> PathBuf {
        self.dir.join(ACTIONS_FILE)
    }

    pub fn result_path(&self) -> PathBuf {
        self.dir.join(RESULT_FILE)
    }

    /// Variables the agent reads to locate the mailbox.
    pub fn agent_env(&self) -> Vec<(String, String)> {
        [
            (STATE_FILE_ENV, self.device_state_path()),
            (ACTIONS_FILE_ENV, self.actions_path()),
            (RESULT_FILE_ENV, self.result_path()),
        ]
        .into_iter()
        .map(|(key, path)| (key.to_string(), path.display().to_string()))
        .collect()
    }

    /// Replace the device-state record. Returns whether the write succeeded.
    #[instrument(skip_all)]
    pub fn publish_device_state(&self, state: &DeviceState) -> bool {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        match write_record(&self.device_state_path(), state) {
            Ok(()) => {
                info!(
                    elements = state.element_count(),
                    focused = %truncate_chars(&state.focused_text, FOCUSED_TEXT_LOG_CHARS),
                    "device state published"
                );
                true
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "device state publish failed");
                false
            }
        }
    }

    /// Take the pending action, deleting its record.
    ///
    /// The record is deleted as soon as it parses, before the caller acts on
    /// it. An unreadable record is left in place and reported as no message.
    #[instrument(skip_all)]
    pub fn take_pending_action(&self) -> Option<PendingAction> {
        let mut reported = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let action: PendingAction = take_record(&self.actions_path(), &mut reported)?;
        debug!(action_type = %action.action_type, action_id = %action.action_id, "pending action taken");
        Some(action)
    }

    #[instrument(skip_all, fields(action_id = %result.action_id, success = result.success))]
    pub fn publish_action_result(&self, result: &ActionResult) -> bool {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        match write_record(&self.result_path(), result) {
            Ok(()) => {
                debug!("action result published");
                true
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "action result publish failed");
                false
            }
        }
    }

    #[instrument(skip_all)]
    pub fn take_action_result(&self) -> Option<ActionResult> {
        let mut reported = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        take_record(&self.result_path(), &mut reported)
    }

    /// Take the result only if it answers `action_id`; any other result stays.
    pub fn take_action_result_for(&self, action_id: &str) -> Option<ActionResult> {
        let mut reported = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let path = self.result_path();
        let result: ActionResult = read_record(&path, &mut reported)?;
        if result.action_id != action_id {
            return None;
        }
        remove_record(&path);
        Some(result)
    }

    /// Read the device state without consuming it.
    pub fn read_device_state(&self) -> Option<DeviceState> {
        let mut reported = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        read_record(&self.device_state_path(), &mut reported)
    }

    /// Write a pending action as the agent would. Returns the written record.
    pub fn submit_action(
        &self,
        action_type: &str,
        parameters: BTreeMap<String, String>,
        now_ms: i64,
    ) -> Option<PendingAction> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let action = PendingAction::new(action_type, parameters, now_ms);
        match write_record(&self.actions_path(), &action) {
            Ok(()) => Some(action),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "action submit failed");
                None
            }
        }
    }

    /// Delete all three records.
    pub fn clear(&self) {
        let mut reported = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        for path in [self.device_state_path(), self.actions_path(), self.result_path()] {
            remove_record(&path);
        }
        reported.clear();
        debug!(dir = %self.dir.display(), "bridge cleared");
    }
}

fn read_record<T: DeserializeOwned>(path: &Path, reported: &mut ReportedCorrupt) -> Option<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            reported.remove(path);
            return None;
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "bridge record unreadable");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(record) => {
            reported.remove(path);
            Some(record)
        }
        Err(err) => {
            if note_corrupt(reported, path) {
                warn!(path = %path.display(), err = %err, "bridge record corrupt");
            } else {
                debug!(path = %path.display(), err = %err, "bridge record still corrupt");
            }
            None
        }
    }
}

/// Remember a corrupt record. Returns true the first time a given version
/// of the file is seen.
fn note_corrupt(reported: &mut ReportedCorrupt, path: &Path) -> bool {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok();
    if reported.get(path) == Some(&modified) {
        return false;
    }
    reported.insert(path.to_path_buf(), modified);
    true
}

fn take_record<T: DeserializeOwned>(path: &Path, reported: &mut ReportedCorrupt) -> Option<T> {
    let record = read_record(path, reported)?;
    remove_record(path);
    Some(record)
}

fn remove_record(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), err = %err, "bridge record delete failed"),
    }
}

fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let buf = serde_json::to_string(record).context("serialize bridge record")?;
    let parent = path
        .parent()
        .with_context(|| format!("bridge path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace record {}", path.display()))?;
    Ok(())
}

fn count_elements(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.iter().map(count_elements).sum(),
        Value::Object(map) => 1 + map.get("children").map(count_elements).unwrap_or(0),
        _ => 0,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
