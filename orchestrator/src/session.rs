//! Lifecycle of the single shell session hosting the agent.
//!
//! At most one session is active. Starting a session always tears down the
//! previous one first. Every host failure is caught here and turned into a
//! status string; nothing propagates to the caller as an error.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::script::{compose_task_script, setup_commands};
use crate::core::types::SessionId;
use crate::io::bridge::AgentBridge;
use crate::io::config::{AgentConfig, OrchestratorConfig};
use crate::io::host::{Geometry, HostedSession, OutputSink, SessionHost, SessionInput, SessionSpec};

/// Everything needed to open and drive a session, resolved from config.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: String,
    pub args: Vec<String>,
    pub workdir: std::path::PathBuf,
    pub geometry: Geometry,
    pub transcript_limit_bytes: usize,
    pub teardown_timeout: Duration,
    pub agent: AgentConfig,
    /// Variables exported during setup, in order.
    pub exports: Vec<(String, String)>,
}

impl SessionOptions {
    pub fn from_config(config: &OrchestratorConfig, root: &Path, bridge: &AgentBridge) -> Self {
        let session = &config.session;
        let mut exports = bridge.agent_env();
        exports.extend(
            config
                .agent
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Self {
            shell: session.shell.clone(),
            args: session.shell_args.clone(),
            workdir: config.session_workdir(root),
            geometry: Geometry {
                cols: session.cols,
                rows: session.rows,
                cell_width_px: session.cell_width_px,
                cell_height_px: session.cell_height_px,
            },
            transcript_limit_bytes: session.transcript_limit_bytes,
            teardown_timeout: Duration::from_millis(session.teardown_timeout_ms),
            agent: config.agent.clone(),
            exports,
        }
    }
}

/// Result of [`ShellSessionManager::start_session`].
#[derive(Debug)]
pub enum StartOutcome {
    Started {
        id: SessionId,
        status: String,
        /// Setup commands still to be written; run off the coordinating thread.
        setup: SetupJob,
    },
    /// The host could not be reached; no session exists.
    Unavailable { status: String },
    /// Both creation paths failed; no session exists.
    Failed { status: String },
}

impl StartOutcome {
    pub fn status(&self) -> &str {
        match self {
            StartOutcome::Started { status, .. }
            | StartOutcome::Unavailable { status }
            | StartOutcome::Failed { status } => status,
        }
    }
}

/// Environment setup commands for a freshly opened session.
#[derive(Debug)]
pub struct SetupJob {
    pub id: SessionId,
    input: SessionInput,
    commands: Vec<String>,
}

impl SetupJob {
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Write every command in order. Blocks on session I/O.
    pub fn run(self) -> Result<()> {
        for command in &self.commands {
            self.input.write_line(command)?;
        }
        debug!(session = %self.id, commands = self.commands.len(), "session setup written");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchRejection {
    Blank,
    NoSession,
    SessionFinished,
    WriteFailed(String),
}

impl std::fmt::Display for DispatchRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchRejection::Blank => f.write_str("Command is empty"),
            DispatchRejection::NoSession => f.write_str("No active session"),
            DispatchRejection::SessionFinished => f.write_str("Session has finished"),
            DispatchRejection::WriteFailed(err) => write!(f, "Failed to send command: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The composed script was written. `mark` is the transcript position
    /// before the task's own output.
    Sent { script: String, mark: u64 },
    Rejected(DispatchRejection),
}

/// Bounded session output, trimmed from the front.
///
/// Positions are absolute byte offsets since the session opened, so a mark
/// taken before trimming stays meaningful afterwards.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    text: String,
    dropped: u64,
    limit: usize,
}

impl Transcript {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            dropped: 0,
            limit,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.dropped += cut as u64;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Absolute position of the first retained byte.
    pub fn start(&self) -> u64 {
        self.dropped
    }

    /// Absolute position of the end of the transcript.
    pub fn mark(&self) -> u64 {
        self.dropped + self.text.len() as u64
    }

    /// Retained text written after `mark`.
    pub fn since(&self, mark: u64) -> &str {
        let offset = usize::try_from(mark.saturating_sub(self.dropped)).unwrap_or(usize::MAX);
        let mut offset = offset.min(self.text.len());
        while !self.text.is_char_boundary(offset) {
            offset += 1;
        }
        &self.text[offset..]
    }
}

/// One active session and its bookkeeping.
pub struct ShellSession<S> {
    pub id: SessionId,
    pub workdir: std::path::PathBuf,
    pub transcript: Transcript,
    pub finished: bool,
    handle: S,
}

pub struct ShellSessionManager<H: SessionHost> {
    host: H,
    options: SessionOptions,
    next_id: u64,
    current: Option<ShellSession<H::Session>>,
}

impl<H: SessionHost> ShellSessionManager<H> {
    pub fn new(host: H, options: SessionOptions) -> Self {
        Self {
            host,
            options,
            next_id: 1,
            current: None,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Takes effect at the next session start.
    pub fn set_options(&mut self, options: SessionOptions) {
        self.options = options;
    }

    pub fn current(&self) -> Option<&ShellSession<H::Session>> {
        self.current.as_ref()
    }

    pub fn current_id(&self) -> Option<SessionId> {
        self.current.as_ref().map(|session| session.id)
    }

    pub fn is_live(&self) -> bool {
        self.current.as_ref().is_some_and(|session| !session.finished)
    }

    /// Tear down any existing session and open a new one.
    ///
    /// `make_sink` builds the streaming-output callback for the new id.
    #[instrument(skip_all)]
    pub fn start_session(&mut self, make_sink: impl Fn(SessionId) -> OutputSink) -> StartOutcome {
        self.teardown_session();

        if !self.host.is_available() {
            warn!(shell = %self.options.shell, "session host unavailable");
            return StartOutcome::Unavailable {
                status: "Session host unavailable".to_string(),
            };
        }

        let id = SessionId(self.next_id);
        self.next_id += 1;
        let spec = SessionSpec {
            id,
            shell: self.options.shell.clone(),
            args: self.options.args.clone(),
            workdir: self.options.workdir.clone(),
            env: Vec::new(),
        };

        let mut handle = match self.host.create_session(&spec, make_sink(id)) {
            Ok(handle) => handle,
            Err(primary) => {
                warn!(session = %id, err = %format!("{primary:#}"), "session creation failed, trying alternate path");
                match self.construct_and_register(&spec, make_sink(id)) {
                    Ok(handle) => handle,
                    Err(alternate) => {
                        warn!(session = %id, err = %format!("{alternate:#}"), "alternate session construction failed");
                        return StartOutcome::Failed {
                            status: format!("Failed to start session: {alternate:#}"),
                        };
                    }
                }
            }
        };

        if let Err(err) = handle.initialize_emulator(self.options.geometry) {
            warn!(session = %id, err = %format!("{err:#}"), "terminal geometry not applied");
        }

        let setup = SetupJob {
            id,
            input: handle.input(),
            commands: setup_commands(&self.options.agent.invocation(), &self.options.exports),
        };
        self.current = Some(ShellSession {
            id,
            workdir: self.options.workdir.clone(),
            transcript: Transcript::new(self.options.transcript_limit_bytes),
            finished: false,
            handle,
        });
        info!(session = %id, workdir = %self.options.workdir.display(), "session started");

        StartOutcome::Started {
            id,
            status: format!("Session ready ({id})"),
            setup,
        }
    }

    fn construct_and_register(&mut self, spec: &SessionSpec, sink: OutputSink) -> Result<H::Session> {
        let mut handle = self.host.construct_session(spec, sink)?;
        if let Err(err) = self.host.register_session(spec.id) {
            if let Err(finish_err) = handle.finish(self.options.teardown_timeout) {
                debug!(err = %format!("{finish_err:#}"), "unregistered session finish failed");
            }
            return Err(err);
        }
        Ok(handle)
    }

    /// Wrap `text` in the bridge preamble and write it to the session.
    ///
    /// Fire-and-forget: progress is only observable through output.
    #[instrument(skip_all)]
    pub fn dispatch_command(&mut self, text: &str) -> DispatchOutcome {
        let command = text.trim();
        if command.is_empty() {
            debug!("blank command rejected");
            return DispatchOutcome::Rejected(DispatchRejection::Blank);
        }
        let Some(session) = self.current.as_mut() else {
            warn!("command rejected: no session");
            return DispatchOutcome::Rejected(DispatchRejection::NoSession);
        };
        if session.finished {
            warn!(session = %session.id, "command rejected: session finished");
            return DispatchOutcome::Rejected(DispatchRejection::SessionFinished);
        }

        let script = compose_task_script(&self.options.agent.invocation(), command);
        let mark = session.transcript.mark();
        match session.handle.input().write_line(&script) {
            Ok(()) => {
                info!(session = %session.id, "command dispatched");
                DispatchOutcome::Sent { script, mark }
            }
            Err(err) => {
                warn!(session = %session.id, err = %format!("{err:#}"), "command write failed");
                DispatchOutcome::Rejected(DispatchRejection::WriteFailed(format!("{err:#}")))
            }
        }
    }

    /// Send an interrupt (Ctrl-C) to the foreground process. Best effort.
    pub fn interrupt(&mut self) {
        if let Some(session) = self.current.as_ref().filter(|s| !s.finished)
            && let Err(err) = session.handle.input().write_raw("\u{3}")
        {
            debug!(session = %session.id, err = %format!("{err:#}"), "interrupt not delivered");
        }
    }

    /// Append output for `id`. Returns false for output from any other session.
    pub fn append_output(&mut self, id: SessionId, text: &str) -> bool {
        match self.current.as_mut() {
            Some(session) if session.id == id => {
                session.transcript.push(text);
                true
            }
            _ => {
                debug!(session = %id, "stale output dropped");
                false
            }
        }
    }

    /// Record that `id` exited. Returns false if it is not the current session.
    pub fn mark_exited(&mut self, id: SessionId) -> bool {
        match self.current.as_mut() {
            Some(session) if session.id == id => {
                session.finished = true;
                info!(session = %id, "session exited");
                true
            }
            _ => false,
        }
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        self.current.as_ref().map(|session| &session.transcript)
    }

    /// Finish and release the current session.
    ///
    /// Always clears the session, even when finishing fails. Returns the id of
    /// the session that was torn down so callers can reset what they derived from it.
    pub fn teardown_session(&mut self) -> Option<SessionId> {
        let mut session = self.current.take()?;
        session.finished = true;
        if let Err(err) = session.handle.finish(self.options.teardown_timeout) {
            warn!(session = %session.id, err = %format!("{err:#}"), "session finish failed");
        }
        self.host.release_session(session.id);
        info!(session = %session.id, "session torn down");
        Some(session.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedHost, discard_sink};

    fn options() -> SessionOptions {
        let bridge = AgentBridge::new("/tmp/orchestrator-bridge");
        SessionOptions::from_config(&OrchestratorConfig::default(), Path::new("/work"), &bridge)
    }

    fn started(outcome: StartOutcome) -> (SessionId, SetupJob) {
        match outcome {
            StartOutcome::Started { id, setup, .. } => (id, setup),
            other => panic!("expected started, got {other:?}"),
        }
    }

    #[test]
    fn transcript_trims_front_and_keeps_marks() {
        let mut transcript = Transcript::new(8);
        transcript.push("abcdef");
        let mark = transcript.mark();
        transcript.push("ghij");
        assert_eq!(transcript.text(), "cdefghij");
        assert_eq!(transcript.since(mark), "ghij");
        transcript.push("klmnopqr");
        assert_eq!(transcript.since(mark), "klmnopqr");
        assert_eq!(transcript.mark(), 18);
        assert_eq!(transcript.start(), 10);
    }

    #[test]
    fn transcript_trim_respects_char_boundaries() {
        let mut transcript = Transcript::new(3);
        transcript.push("aé");
        transcript.push("bc");
        assert_eq!(transcript.text(), "bc");
    }

    #[test]
    fn start_allocates_monotonic_ids_and_tears_down_previous() {
        let host = ScriptedHost::new();
        let mut manager = ShellSessionManager::new(host.clone(), options());

        let (first, _) = started(manager.start_session(discard_sink));
        let (second, _) = started(manager.start_session(discard_sink));

        assert_eq!(first, SessionId(1));
        assert_eq!(second, SessionId(2));
        assert_eq!(host.finished(), vec![first]);
        assert_eq!(host.registered(), vec![second]);
    }

    #[test]
    fn setup_connects_bridge_and_exports_mailbox_paths() {
        let host = ScriptedHost::new();
        let mut manager = ShellSessionManager::new(host.clone(), options());
        let (id, setup) = started(manager.start_session(discard_sink));
        setup.run().expect("setup");

        let written = host.written(id);
        assert_eq!(written[0], "adb connect 127.0.0.1:5555 >/dev/null 2>&1 || true\n");
        assert!(
            written
                .iter()
                .any(|line| line.starts_with("export DROIDRUN_ACTIONS_FILE='/tmp/orchestrator-bridge/python_actions.json'"))
        );
    }

    #[test]
    fn unavailable_host_leaves_no_session() {
        let host = ScriptedHost::new();
        host.set_available(false);
        let mut manager = ShellSessionManager::new(host, options());
        let outcome = manager.start_session(discard_sink);
        assert!(matches!(outcome, StartOutcome::Unavailable { .. }));
        assert!(manager.current().is_none());
    }

    /// The alternate path runs once and registers explicitly.
    #[test]
    fn primary_failure_falls_back_to_alternate_path() {
        let host = ScriptedHost::new();
        host.fail_primary(true);
        let mut manager = ShellSessionManager::new(host.clone(), options());
        let (id, _) = started(manager.start_session(discard_sink));
        assert_eq!(host.registered(), vec![id]);
        assert_eq!(host.constructed(), vec![id]);
    }

    #[test]
    fn both_paths_failing_reports_status() {
        let host = ScriptedHost::new();
        host.fail_primary(true);
        host.fail_alternate(true);
        let mut manager = ShellSessionManager::new(host, options());
        let outcome = manager.start_session(discard_sink);
        assert!(outcome.status().starts_with("Failed to start session"));
        assert!(manager.current().is_none());
    }

    #[test]
    fn blank_command_writes_nothing() {
        let host = ScriptedHost::new();
        let mut manager = ShellSessionManager::new(host.clone(), options());
        let (id, _) = started(manager.start_session(discard_sink));

        let outcome = manager.dispatch_command("   \n");
        assert_eq!(outcome, DispatchOutcome::Rejected(DispatchRejection::Blank));
        assert!(host.written(id).is_empty());
    }

    #[test]
    fn dispatch_requires_live_session() {
        let host = ScriptedHost::new();
        let mut manager = ShellSessionManager::new(host, options());
        assert_eq!(
            manager.dispatch_command("open settings"),
            DispatchOutcome::Rejected(DispatchRejection::NoSession)
        );

        let (id, _) = started(manager.start_session(discard_sink));
        assert!(manager.mark_exited(id));
        assert_eq!(
            manager.dispatch_command("open settings"),
            DispatchOutcome::Rejected(DispatchRejection::SessionFinished)
        );
    }

    #[test]
    fn dispatch_writes_composed_script_with_newline() {
        let host = ScriptedHost::new();
        let mut manager = ShellSessionManager::new(host.clone(), options());
        let (id, _) = started(manager.start_session(discard_sink));
        manager.append_output(id, "~ $ ");

        let DispatchOutcome::Sent { script, mark } = manager.dispatch_command(" open settings ") else {
            panic!("expected sent");
        };
        assert!(script.ends_with("droidrun run 'open settings'"));
        assert_eq!(mark, 4);
        assert_eq!(host.written(id), vec![format!("{script}\n")]);
    }

    #[test]
    fn output_from_old_session_is_dropped() {
        let host = ScriptedHost::new();
        let mut manager = ShellSessionManager::new(host, options());
        let (old, _) = started(manager.start_session(discard_sink));
        let (new, _) = started(manager.start_session(discard_sink));

        assert!(!manager.append_output(old, "late"));
        assert!(manager.append_output(new, "fresh"));
        assert_eq!(manager.transcript().map(Transcript::text), Some("fresh"));
    }

    #[test]
    fn teardown_clears_even_when_finish_fails() {
        let host = ScriptedHost::new();
        host.fail_finish(true);
        let mut manager = ShellSessionManager::new(host.clone(), options());
        let (id, _) = started(manager.start_session(discard_sink));

        assert_eq!(manager.teardown_session(), Some(id));
        assert!(manager.current().is_none());
        assert!(host.registered().is_empty());
        assert_eq!(manager.teardown_session(), None);
    }
}
