//! Loop-level harness tests for full orchestrator lifecycle scenarios.
//!
//! These tests drive the coordinating loop through scripted sessions to verify
//! end-to-end behavior: dispatch, output classification, lifecycle
//! transitions, stale-signal handling and status publication.

use std::sync::Arc;

use orchestrator::core::types::{MessageKind, SessionId, StatusSnapshot, TaskStatus};
use orchestrator::io::config::{OrchestratorConfig, load_config};
use orchestrator::io::init::OrchestratorPaths;
use orchestrator::io::status_store::{StatusFileSink, read_status};
use orchestrator::orchestrator::{Event, Flow, Orchestrator};
use orchestrator::test_support::{ManualClock, RecordingObserver, ScriptedHost, fixture_root};

const ECHO: &str = "~ $ adb disconnect 127.0.0.1:5555 >/dev/null 2>&1 || true; \
                    adb connect 127.0.0.1:5555 >/dev/null 2>&1 || true; \
                    droidrun run 'open settings'\n";

struct Harness {
    _temp: tempfile::TempDir,
    paths: OrchestratorPaths,
    host: ScriptedHost,
    clock: Arc<ManualClock>,
    observer: RecordingObserver,
    orchestrator: Orchestrator<ScriptedHost>,
}

impl Harness {
    fn new() -> Self {
        Self::with_host(ScriptedHost::new())
    }

    fn with_host(host: ScriptedHost) -> Self {
        Self::configured(host, |_| {})
    }

    fn configured(host: ScriptedHost, configure: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        let (temp, paths) = fixture_root();
        let mut config = load_config(&paths.config_path).expect("config");
        configure(&mut config);
        let clock = Arc::new(ManualClock::new(10_000));
        let observer = RecordingObserver::new();
        let mut orchestrator = Orchestrator::new(temp.path(), config, host.clone(), clock.clone());
        orchestrator.add_observer(observer.clone());
        orchestrator.add_observer(StatusFileSink::new(&paths.status_path));
        orchestrator.handle(Event::StartSession);
        Self {
            _temp: temp,
            paths,
            host,
            clock,
            observer,
            orchestrator,
        }
    }

    fn send(&mut self, event: Event) {
        assert_eq!(self.orchestrator.handle(event), Flow::Continue);
    }

    /// Deliver `text` from `session` through the event channel.
    fn emit(&mut self, session: u64, text: &str) {
        self.host.emit(SessionId(session), text);
        self.orchestrator.handle_pending();
    }

    fn snapshot(&self) -> StatusSnapshot {
        self.observer.last().expect("published snapshot")
    }

    fn scripts_written(&self, session: u64) -> Vec<String> {
        self.host
            .written(SessionId(session))
            .into_iter()
            .filter(|line| line.contains("droidrun run"))
            .collect()
    }

    fn has_message(&self, kind: MessageKind, needle: &str) -> bool {
        self.snapshot()
            .messages
            .iter()
            .any(|m| m.kind == kind && m.text.contains(needle))
    }
}

/// Full lifecycle: dispatch → streamed agent output → success.
///
/// Verifies the composed script reaches the session, the task shows as
/// running with its text, a completion phrase ends it, and the mirrored status
/// file matches the last published snapshot.
#[test]
fn completion_phrase_finishes_task() {
    let mut h = Harness::new();
    h.send(Event::Dispatch("open settings".to_string()));

    let running = h.snapshot();
    assert_eq!(running.state, TaskStatus::Running);
    assert_eq!(running.task.as_deref(), Some("open settings"));
    assert!(running.running);
    assert_eq!(running.status_line, "Running: open settings");
    assert_eq!(h.scripts_written(1).len(), 1);

    h.emit(1, ECHO);
    assert_eq!(h.snapshot().state, TaskStatus::Running);

    h.emit(1, "Step 1: opening settings\nGoal achieved!\n");
    let done = h.snapshot();
    assert_eq!(done.state, TaskStatus::Success);
    assert_eq!(done.task, None);
    assert!(!done.running);
    assert!(h.has_message(MessageKind::User, "open settings"));
    assert!(h.has_message(MessageKind::Output, "Step 1: opening settings"));
    assert!(h.has_message(MessageKind::System, "Task completed"));

    assert_eq!(read_status(&h.paths.status_path).expect("status file"), done);
}

#[test]
fn failure_phrase_fails_task() {
    let mut h = Harness::new();
    h.send(Event::Dispatch("open settings".to_string()));
    h.emit(1, ECHO);
    h.emit(1, "Task failed: settings app not found\n");
    assert_eq!(h.snapshot().state, TaskStatus::Error);
    assert!(h.has_message(MessageKind::Error, "Task failed"));
}

/// A returned prompt counts only after the grace window, picked up by a tick.
#[test]
fn prompt_return_completes_after_grace_window() {
    let mut h = Harness::new();
    h.send(Event::Dispatch("open settings".to_string()));

    h.clock.advance(500);
    h.emit(1, ECHO);
    h.emit(1, "step one\nstep two\nstep three\n~ $ ");
    assert_eq!(h.snapshot().state, TaskStatus::Running);

    h.clock.advance(1_000);
    h.send(Event::Tick);
    assert_eq!(h.snapshot().state, TaskStatus::Running);

    h.clock.advance(1_500);
    h.send(Event::Tick);
    assert_eq!(h.snapshot().state, TaskStatus::Success);
}

#[test]
fn blank_dispatch_changes_nothing() {
    let mut h = Harness::new();
    let before = h.snapshot();
    h.send(Event::Dispatch("   ".to_string()));
    assert!(h.scripts_written(1).is_empty());
    assert_eq!(h.orchestrator.machine().status(), TaskStatus::Idle);
    assert_eq!(h.snapshot().messages, before.messages);
}

#[test]
fn second_task_while_running_is_rejected() {
    let mut h = Harness::new();
    h.send(Event::Dispatch("open settings".to_string()));
    h.send(Event::Dispatch("open camera".to_string()));
    h.send(Event::Dispatch("open settings".to_string()));

    let snapshot = h.snapshot();
    assert_eq!(snapshot.task.as_deref(), Some("open settings"));
    assert_eq!(h.scripts_written(1).len(), 1);
    assert!(h.has_message(MessageKind::Error, "cannot start 'open camera'"));
}

/// A stop clears the task at once; a completion arriving later is stale.
#[test]
fn stop_discards_late_completion() {
    let mut h = Harness::new();
    h.send(Event::Dispatch("open settings".to_string()));
    h.emit(1, ECHO);

    h.send(Event::Stop);
    let stopped = h.snapshot();
    assert_eq!(stopped.state, TaskStatus::Idle);
    assert_eq!(stopped.task, None);
    assert_eq!(stopped.status_line, "Stopped: open settings");
    assert!(h.host.written(SessionId(1)).contains(&"\u{3}".to_string()));

    h.emit(1, "Goal achieved\n");
    assert_eq!(h.snapshot().state, TaskStatus::Idle);

    h.send(Event::AgentCompleted {
        success: true,
        reason: "done".to_string(),
    });
    assert_eq!(h.snapshot().state, TaskStatus::Idle);
}

#[test]
fn agent_completion_report_drives_outcome() {
    let mut h = Harness::new();
    h.send(Event::Dispatch("open settings".to_string()));
    h.send(Event::AgentCompleted {
        success: false,
        reason: "Settings app crashed".to_string(),
    });

    assert_eq!(h.snapshot().state, TaskStatus::Error);
    assert!(h.has_message(MessageKind::System, "Settings app crashed"));

    // Finished tasks can be followed by a new one.
    h.send(Event::Dispatch("open camera".to_string()));
    assert_eq!(h.snapshot().state, TaskStatus::Running);
}

/// Restarting tears the old session down and ignores its late output.
#[test]
fn restart_replaces_session_and_drops_old_output() {
    let mut h = Harness::new();
    h.send(Event::Dispatch("open settings".to_string()));
    h.send(Event::StartSession);

    let snapshot = h.snapshot();
    assert_eq!(snapshot.session, Some(SessionId(2)));
    assert_eq!(snapshot.state, TaskStatus::Idle);
    assert_eq!(h.host.finished(), vec![SessionId(1)]);

    h.send(Event::Dispatch("open camera".to_string()));
    h.emit(1, "Goal achieved\n");
    assert_eq!(h.snapshot().state, TaskStatus::Running);
    h.emit(2, "Goal achieved\n");
    assert_eq!(h.snapshot().state, TaskStatus::Success);
}

#[test]
fn session_exit_fails_running_task() {
    let mut h = Harness::new();
    h.send(Event::Dispatch("open settings".to_string()));
    h.host.exit(SessionId(1));
    h.orchestrator.handle_pending();

    let snapshot = h.snapshot();
    assert_eq!(snapshot.state, TaskStatus::Error);
    assert_eq!(snapshot.status_line, "Session exited");

    h.send(Event::Dispatch("open camera".to_string()));
    assert!(h.has_message(MessageKind::Error, "Session has finished"));
}

#[test]
fn unavailable_host_reports_status_and_rejects_commands() {
    let host = ScriptedHost::new();
    host.set_available(false);
    let mut h = Harness::with_host(host);

    assert_eq!(h.snapshot().status_line, "Session host unavailable");
    assert_eq!(h.snapshot().session, None);
    h.send(Event::Dispatch("open settings".to_string()));
    assert!(h.has_message(MessageKind::Error, "No active session"));
    assert_eq!(h.snapshot().state, TaskStatus::Idle);
}

#[test]
fn reset_clears_messages_and_mailbox() {
    let mut h = Harness::new();
    let bridge = h.orchestrator.bridge();
    h.send(Event::Dispatch("open settings".to_string()));
    assert!(bridge.submit_action("back", Default::default(), 1).is_some());

    h.send(Event::Reset);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.state, TaskStatus::Idle);
    assert!(snapshot.messages.iter().all(|m| m.kind == MessageKind::System));

    // The mailbox is cleared off the loop; the next dispatch waits for it.
    h.send(Event::Dispatch("open camera".to_string()));
    assert_eq!(h.snapshot().state, TaskStatus::Running);
    assert!(bridge.take_pending_action().is_none());
}

#[test]
fn shutdown_waits_for_pending_mailbox_clear() {
    let mut h = Harness::new();
    let bridge = h.orchestrator.bridge();
    h.send(Event::Dispatch("open settings".to_string()));
    assert!(bridge.submit_action("back", Default::default(), 1).is_some());

    h.send(Event::Reset);
    assert_eq!(h.orchestrator.handle(Event::Shutdown), Flow::Exit);
    assert!(bridge.take_pending_action().is_none());
}

#[test]
fn config_change_updates_show_logs() {
    let mut h = Harness::new();
    let mut config = h.orchestrator.config().clone();
    config.ui.show_logs = false;
    h.send(Event::ConfigChanged(Box::new(config)));
    assert!(!h.snapshot().show_logs);
}

#[test]
fn shutdown_tears_down_session() {
    let mut h = Harness::new();
    assert_eq!(h.orchestrator.handle(Event::Shutdown), Flow::Exit);
    assert_eq!(h.host.finished(), vec![SessionId(1)]);
    assert!(h.host.registered().is_empty());
}

/// Output past the transcript limit is logged once per chunk, not re-logged
/// from the trimmed transcript on every event.
#[test]
fn long_output_is_logged_once_after_transcript_trims() {
    let mut h = Harness::configured(ScriptedHost::new(), |config| {
        config.session.transcript_limit_bytes = 1_000;
    });
    h.send(Event::Dispatch("open settings".to_string()));

    let mut emitted = 0;
    for n in 0..200 {
        let line = format!("plain output line {n:04}\n");
        emitted += line.len();
        h.emit(1, &line);
    }

    let snapshot = h.snapshot();
    let outputs: Vec<&str> = snapshot
        .messages
        .iter()
        .filter(|m| m.kind == MessageKind::Output)
        .map(|m| m.text.as_str())
        .collect();
    assert_eq!(outputs.len(), 200);
    assert_eq!(outputs.last().copied(), Some("plain output line 0199"));
    let logged: usize = snapshot.messages.iter().map(|m| m.text.len()).sum();
    assert!(logged < emitted + 1_000, "logged {logged} bytes for {emitted} emitted");
}
