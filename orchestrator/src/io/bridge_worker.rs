//! Polling loop that serves the agent's side of the mailbox.
//!
//! Each cycle publishes fresh device state from the automation collaborator,
//! takes at most one pending action, executes it and publishes the result.
//! Outcomes are reported as [`BridgeEvent`]s for the coordinating loop; the
//! worker never touches orchestrator state itself.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::Clock;
use crate::io::bridge::{ActionResult, AgentBridge, DeviceState, PendingAction};

/// Action the agent sends when it considers its goal finished.
pub const COMPLETE_ACTION: &str = "complete";

/// Produces device state and performs device actions.
pub trait AutomationCollaborator: Send {
    /// Current device state, or `None` if nothing new is available.
    fn device_state(&mut self, now_ms: i64) -> Result<Option<DeviceState>>;

    /// Perform `action`, returning the result text handed back to the agent.
    fn execute(&mut self, action: &PendingAction) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    ActionHandled {
        action_type: String,
        action_id: String,
        success: bool,
        detail: String,
    },
    AgentCompleted {
        success: bool,
        reason: String,
    },
}

pub struct BridgeWorker<C> {
    bridge: Arc<AgentBridge>,
    collaborator: C,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl<C: AutomationCollaborator> BridgeWorker<C> {
    pub fn new(
        bridge: Arc<AgentBridge>,
        collaborator: C,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bridge,
            collaborator,
            clock,
            poll_interval,
        }
    }

    /// Run one refresh cycle.
    #[instrument(skip_all)]
    pub fn poll_once(&mut self) -> Vec<BridgeEvent> {
        let now = self.clock.now_ms();
        match self.collaborator.device_state(now) {
            Ok(Some(state)) => {
                self.bridge.publish_device_state(&state);
            }
            Ok(None) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "device state unavailable"),
        }

        let Some(action) = self.bridge.take_pending_action() else {
            return Vec::new();
        };
        self.handle_action(action)
    }

    fn handle_action(&mut self, action: PendingAction) -> Vec<BridgeEvent> {
        let now = self.clock.now_ms();
        let mut events = Vec::new();

        let outcome = if action.action_type == COMPLETE_ACTION {
            let success = action
                .param("success")
                .is_some_and(|value| value.eq_ignore_ascii_case("true"));
            let reason = action.param("reason").unwrap_or_default().to_string();
            events.push(BridgeEvent::AgentCompleted { success, reason });
            Ok("acknowledged".to_string())
        } else {
            self.collaborator.execute(&action)
        };

        let (result, success, detail) = match outcome {
            Ok(text) => (ActionResult::ok(&action.action_id, text.clone(), now), true, text),
            Err(err) => {
                let message = format!("{err:#}");
                (
                    ActionResult::failed(&action.action_id, message.clone(), now),
                    false,
                    message,
                )
            }
        };
        if !self.bridge.publish_action_result(&result) {
            warn!(action_id = %action.action_id, "action result lost");
        }
        debug!(action_type = %action.action_type, success, "action handled");

        events.insert(
            0,
            BridgeEvent::ActionHandled {
                action_type: action.action_type,
                action_id: action.action_id,
                success,
                detail,
            },
        );
        events
    }

    /// Poll until `stop` is set, reporting each event through `notify`.
    pub fn spawn(
        mut self,
        stop: Arc<AtomicBool>,
        notify: impl Fn(BridgeEvent) + Send + 'static,
    ) -> Result<thread::JoinHandle<()>>
    where
        C: 'static,
    {
        thread::Builder::new()
            .name("bridge-worker".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    for event in self.poll_once() {
                        notify(event);
                    }
                    thread::sleep(self.poll_interval);
                }
                debug!("bridge worker stopped");
            })
            .context("spawn bridge worker")
    }
}

/// Device state as written by an external accessibility collaborator.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceState {
    #[serde(default)]
    formatted_text: String,
    #[serde(default)]
    focused_text: String,
    #[serde(default)]
    a11y_tree: Value,
    #[serde(default)]
    phone_state: Value,
}

/// Reads device state from a JSON file kept up to date by another process.
///
/// Has no device to act on, so every action other than `complete` fails with
/// an explanatory error.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFileCollaborator {
    source: Option<PathBuf>,
    last_modified: Option<std::time::SystemTime>,
}

impl SnapshotFileCollaborator {
    pub fn new(source: Option<PathBuf>) -> Self {
        Self {
            source,
            last_modified: None,
        }
    }
}

impl AutomationCollaborator for SnapshotFileCollaborator {
    fn device_state(&mut self, now_ms: i64) -> Result<Option<DeviceState>> {
        let Some(path) = &self.source else {
            return Ok(None);
        };
        let modified = match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
        };
        if self.last_modified == Some(modified) {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let source: SourceState =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        self.last_modified = Some(modified);

        let tree = if source.a11y_tree.is_null() {
            Value::Array(Vec::new())
        } else {
            source.a11y_tree
        };
        let phone = if source.phone_state.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            source.phone_state
        };
        Ok(Some(DeviceState::new(
            source.formatted_text,
            source.focused_text,
            &tree,
            &phone,
            now_ms,
        )))
    }

    fn execute(&mut self, action: &PendingAction) -> Result<String> {
        Err(anyhow!(
            "no device automation available for '{}'",
            action.action_type
        ))
    }
}
