//! Scripted doubles for exercising the orchestrator without real processes.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::types::{Clock, SessionId, StatusSnapshot};
use crate::io::bridge::{DeviceState, PendingAction};
use crate::io::bridge_worker::AutomationCollaborator;
use crate::io::host::{Geometry, HostedSession, OutputSink, SessionHost, SessionInput, SessionSpec};
use crate::io::init::{InitOptions, OrchestratorPaths, init_layout};
use crate::io::status_store::StatusObserver;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Temporary project root with `.orchestrator/` already initialized.
pub fn fixture_root() -> (tempfile::TempDir, OrchestratorPaths) {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_layout(temp.path(), &InitOptions { force: false }).expect("init layout");
    (temp, paths)
}

/// Output sink that drops everything.
pub fn discard_sink(id: SessionId) -> OutputSink {
    OutputSink::new(id, |_, _| {})
}

#[derive(Default)]
struct HostState {
    available: bool,
    fail_primary: bool,
    fail_alternate: bool,
    fail_finish: bool,
    registered: Vec<SessionId>,
    constructed: Vec<SessionId>,
    finished: Vec<SessionId>,
    geometry: BTreeMap<SessionId, Geometry>,
    writes: BTreeMap<SessionId, Arc<Mutex<Vec<String>>>>,
    sinks: BTreeMap<SessionId, OutputSink>,
}

/// Session host that records writes and lets tests inject output.
#[derive(Clone)]
pub struct ScriptedHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for ScriptedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                available: true,
                ..HostState::default()
            })),
        }
    }

    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    pub fn fail_primary(&self, fail: bool) {
        lock(&self.state).fail_primary = fail;
    }

    pub fn fail_alternate(&self, fail: bool) {
        lock(&self.state).fail_alternate = fail;
    }

    pub fn fail_finish(&self, fail: bool) {
        lock(&self.state).fail_finish = fail;
    }

    pub fn registered(&self) -> Vec<SessionId> {
        lock(&self.state).registered.clone()
    }

    pub fn constructed(&self) -> Vec<SessionId> {
        lock(&self.state).constructed.clone()
    }

    pub fn finished(&self) -> Vec<SessionId> {
        lock(&self.state).finished.clone()
    }

    pub fn geometry(&self, id: SessionId) -> Option<Geometry> {
        lock(&self.state).geometry.get(&id).copied()
    }

    /// Every write made to session `id`, one entry per write.
    pub fn written(&self, id: SessionId) -> Vec<String> {
        let writes = lock(&self.state).writes.get(&id).cloned();
        writes.map(|w| lock(&w).clone()).unwrap_or_default()
    }

    /// Deliver `text` as if session `id` had printed it.
    pub fn emit(&self, id: SessionId, text: &str) {
        if let Some(sink) = self.sink(id) {
            sink.data(text.to_string());
        }
    }

    /// Report session `id` as exited.
    pub fn exit(&self, id: SessionId) {
        if let Some(sink) = self.sink(id) {
            sink.exited();
        }
    }

    fn sink(&self, id: SessionId) -> Option<OutputSink> {
        lock(&self.state).sinks.get(&id).cloned()
    }

    fn open(&self, spec: &SessionSpec, sink: OutputSink) -> ScriptedSession {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let mut state = lock(&self.state);
        state.writes.insert(spec.id, Arc::clone(&writes));
        state.sinks.insert(spec.id, sink);
        ScriptedSession {
            id: spec.id,
            host: Arc::clone(&self.state),
            writes,
        }
    }
}

impl SessionHost for ScriptedHost {
    type Session = ScriptedSession;

    fn is_available(&self) -> bool {
        lock(&self.state).available
    }

    fn create_session(&mut self, spec: &SessionSpec, sink: OutputSink) -> Result<ScriptedSession> {
        if lock(&self.state).fail_primary {
            return Err(anyhow!("scripted primary failure"));
        }
        let session = self.open(spec, sink);
        lock(&self.state).registered.push(spec.id);
        Ok(session)
    }

    fn construct_session(&mut self, spec: &SessionSpec, sink: OutputSink) -> Result<ScriptedSession> {
        if lock(&self.state).fail_alternate {
            return Err(anyhow!("scripted alternate failure"));
        }
        lock(&self.state).constructed.push(spec.id);
        Ok(self.open(spec, sink))
    }

    fn register_session(&mut self, id: SessionId) -> Result<()> {
        let mut state = lock(&self.state);
        if state.registered.contains(&id) {
            return Err(anyhow!("{id} is already registered"));
        }
        state.registered.push(id);
        Ok(())
    }

    fn release_session(&mut self, id: SessionId) {
        lock(&self.state).registered.retain(|registered| *registered != id);
    }
}

pub struct ScriptedSession {
    id: SessionId,
    host: Arc<Mutex<HostState>>,
    writes: Arc<Mutex<Vec<String>>>,
}

struct RecordingWriter {
    writes: Arc<Mutex<Vec<String>>>,
}

impl Write for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.writes).push(String::from_utf8_lossy(buf).into_owned());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl HostedSession for ScriptedSession {
    fn input(&self) -> SessionInput {
        SessionInput::new(Box::new(RecordingWriter {
            writes: Arc::clone(&self.writes),
        }))
    }

    fn initialize_emulator(&mut self, geometry: Geometry) -> Result<()> {
        lock(&self.host).geometry.insert(self.id, geometry);
        Ok(())
    }

    fn finish(&mut self, _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.host);
        state.finished.push(self.id);
        if state.fail_finish {
            return Err(anyhow!("scripted finish failure"));
        }
        Ok(())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Status observer that keeps every snapshot it receives.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    snapshots: Arc<Mutex<Vec<StatusSnapshot>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<StatusSnapshot> {
        lock(&self.snapshots).clone()
    }

    pub fn last(&self) -> Option<StatusSnapshot> {
        lock(&self.snapshots).last().cloned()
    }
}

impl StatusObserver for RecordingObserver {
    fn status_changed(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        lock(&self.snapshots).push(snapshot.clone());
        Ok(())
    }
}

#[derive(Default)]
struct CollaboratorState {
    states: VecDeque<DeviceState>,
    responses: BTreeMap<String, Result<String, String>>,
    executed: Vec<String>,
}

/// Automation collaborator with canned device states and action responses.
#[derive(Clone, Default)]
pub struct ScriptedCollaborator {
    state: Arc<Mutex<CollaboratorState>>,
}

impl ScriptedCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a device state for the next refresh cycle.
    pub fn with_state(self, state: DeviceState) -> Self {
        lock(&self.state).states.push_back(state);
        self
    }

    pub fn respond(self, action_type: &str, response: Result<String, String>) -> Self {
        lock(&self.state)
            .responses
            .insert(action_type.to_string(), response);
        self
    }

    /// Action types executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.state).executed.clone()
    }
}

impl AutomationCollaborator for ScriptedCollaborator {
    fn device_state(&mut self, now_ms: i64) -> Result<Option<DeviceState>> {
        Ok(lock(&self.state).states.pop_front().map(|mut state| {
            state.timestamp = now_ms;
            state
        }))
    }

    fn execute(&mut self, action: &PendingAction) -> Result<String> {
        let mut state = lock(&self.state);
        state.executed.push(action.action_type.clone());
        match state.responses.get(&action.action_type) {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(err)) => Err(anyhow!(err.clone())),
            None => Err(anyhow!("unscripted action '{}'", action.action_type)),
        }
    }
}
