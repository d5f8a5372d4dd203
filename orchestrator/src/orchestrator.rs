//! The coordinating loop: the single owner of session, task and lifecycle state.
//!
//! Output arrival, user commands, worker results and timer ticks are all
//! delivered as [`Event`]s on one channel and applied in order, so nothing else
//! mutates orchestrator state. Blocking work (session setup, bridge polling)
//! runs on worker threads that post their results back as events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::TaskProgressClassifier;
use crate::core::log_messages::{LogMessageManager, Observation};
use crate::core::state_machine::{TaskStateMachine, Transition};
use crate::core::types::{Clock, SessionId, Signal, StatusSnapshot, TaskDescriptor, TaskStatus};
use crate::io::bridge::AgentBridge;
use crate::io::bridge_worker::BridgeEvent;
use crate::io::config::OrchestratorConfig;
use crate::io::host::{OutputSink, SessionHost, SessionOutput};
use crate::io::status_store::StatusObserver;
use crate::session::{DispatchOutcome, DispatchRejection, SessionOptions, ShellSessionManager, StartOutcome};

/// Everything the coordinating loop reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartSession,
    Output { session: SessionId, text: String },
    SessionExited { session: SessionId },
    SetupFinished { session: SessionId, error: Option<String> },
    Dispatch(String),
    Stop,
    Reset,
    ActionHandled { action_type: String, success: bool, detail: String },
    AgentCompleted { success: bool, reason: String },
    ConfigChanged(Box<OrchestratorConfig>),
    Tick,
    Shutdown,
}

impl From<BridgeEvent> for Event {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::ActionHandled {
                action_type,
                success,
                detail,
                ..
            } => Event::ActionHandled {
                action_type,
                success,
                detail,
            },
            BridgeEvent::AgentCompleted { success, reason } => {
                Event::AgentCompleted { success, reason }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Orchestrator<H: SessionHost> {
    root: PathBuf,
    config: OrchestratorConfig,
    sessions: ShellSessionManager<H>,
    classifier: TaskProgressClassifier,
    machine: TaskStateMachine,
    log: LogMessageManager,
    bridge: Arc<AgentBridge>,
    clock: Arc<dyn Clock>,
    observers: Vec<Box<dyn StatusObserver>>,
    status_line: String,
    /// Transcript position where the running task's output begins.
    task_mark: u64,
    last_published: Option<StatusSnapshot>,
    /// Mailbox clear still running on its worker.
    bridge_clear: Option<JoinHandle<()>>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl<H: SessionHost> Orchestrator<H> {
    pub fn new(root: &Path, config: OrchestratorConfig, host: H, clock: Arc<dyn Clock>) -> Self {
        let bridge = Arc::new(AgentBridge::new(config.bridge_dir(root)));
        let options = SessionOptions::from_config(&config, root, &bridge);
        let classifier =
            TaskProgressClassifier::new(&config.classifier.phrases, config.classifier.grace_ms);
        let marker = config.agent.invocation().marker();
        if !marker.eq_ignore_ascii_case(&config.classifier.phrases.invocation_marker) {
            warn!(
                marker,
                contract = %config.classifier.phrases.invocation_marker,
                "invocation marker differs from agent invocation; completion detection may misfire"
            );
        }
        let (tx, rx) = mpsc::channel();
        Self {
            root: root.to_path_buf(),
            config,
            sessions: ShellSessionManager::new(host, options),
            classifier,
            machine: TaskStateMachine::new(),
            log: LogMessageManager::new(),
            bridge,
            clock,
            observers: Vec::new(),
            status_line: "Idle".to_string(),
            task_mark: 0,
            last_published: None,
            bridge_clear: None,
            tx,
            rx,
        }
    }

    /// Handle for posting events from other threads.
    pub fn sender(&self) -> Sender<Event> {
        self.tx.clone()
    }

    pub fn bridge(&self) -> Arc<AgentBridge> {
        Arc::clone(&self.bridge)
    }

    pub fn add_observer(&mut self, observer: impl StatusObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn machine(&self) -> &TaskStateMachine {
        &self.machine
    }

    pub fn sessions(&self) -> &ShellSessionManager<H> {
        &self.sessions
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Current externally visible status.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.machine.status(),
            task: self.machine.current_task().map(|task| task.command.clone()),
            running: self.machine.is_running(),
            status_line: self.status_line.clone(),
            show_logs: self.config.ui.show_logs,
            session: self.sessions.current_id(),
            messages: self.log.messages().to_vec(),
        }
    }

    /// Process events until `Shutdown`, ticking while the channel is quiet.
    pub fn run(mut self) -> Result<()> {
        let tick = Duration::from_millis(self.config.session.tick_interval_ms);
        info!(tick_ms = self.config.session.tick_interval_ms, "orchestrator loop started");
        loop {
            let event = match self.rx.recv_timeout(tick) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => Event::Tick,
                Err(RecvTimeoutError::Disconnected) => Event::Shutdown,
            };
            if self.handle(event) == Flow::Exit {
                break;
            }
        }
        info!("orchestrator loop stopped");
        Ok(())
    }

    /// Apply every event already queued, without waiting.
    pub fn handle_pending(&mut self) -> Flow {
        while let Ok(event) = self.rx.try_recv() {
            if self.handle(event) == Flow::Exit {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// Apply one event, then publish the resulting status.
    #[instrument(skip_all, fields(event = event_name(&event)))]
    pub fn handle(&mut self, event: Event) -> Flow {
        let flow = match event {
            Event::StartSession => {
                self.start_session();
                Flow::Continue
            }
            Event::Output { session, text } => {
                if self.sessions.append_output(session, &text) {
                    self.evaluate();
                }
                Flow::Continue
            }
            Event::SessionExited { session } => {
                self.session_exited(session);
                Flow::Continue
            }
            Event::SetupFinished { session, error } => {
                self.setup_finished(session, error);
                Flow::Continue
            }
            Event::Dispatch(text) => {
                self.dispatch(&text);
                Flow::Continue
            }
            Event::Stop => {
                let transition = self.machine.force_stop();
                self.sessions.interrupt();
                self.apply_transition(transition);
                Flow::Continue
            }
            Event::Reset => {
                let transition = self.machine.transition_to_idle();
                self.apply_transition(transition);
                self.log.clear();
                self.clear_bridge();
                Flow::Continue
            }
            Event::ActionHandled {
                action_type,
                success,
                detail,
            } => {
                let now = self.clock.now_ms();
                if success {
                    self.log.push_system(format!("Action {action_type}: done"), now);
                } else {
                    self.log
                        .push_error(format!("Action {action_type} failed: {detail}"), now);
                }
                Flow::Continue
            }
            Event::AgentCompleted { success, reason } => {
                self.agent_completed(success, reason);
                Flow::Continue
            }
            Event::ConfigChanged(config) => {
                self.apply_config(*config);
                Flow::Continue
            }
            Event::Tick => {
                self.evaluate();
                Flow::Continue
            }
            Event::Shutdown => {
                self.clear_session();
                self.await_bridge_clear();
                Flow::Exit
            }
        };
        self.publish();
        flow
    }

    fn start_session(&mut self) {
        self.clear_session();
        self.clear_bridge();

        let tx = self.tx.clone();
        let outcome = self.sessions.start_session(|id| {
            let tx = tx.clone();
            OutputSink::new(id, move |session, output| {
                let event = match output {
                    SessionOutput::Data(text) => Event::Output { session, text },
                    SessionOutput::Exited => Event::SessionExited { session },
                };
                // The loop is gone during shutdown; late output has nowhere to go.
                let _ = tx.send(event);
            })
        });

        self.status_line = outcome.status().to_string();
        let now = self.clock.now_ms();
        match outcome {
            StartOutcome::Started { id, setup, .. } => {
                self.log.push_system(self.status_line.clone(), now);
                let tx = self.tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{id}-setup"))
                    .spawn(move || {
                        let error = setup.run().err().map(|err| format!("{err:#}"));
                        let _ = tx.send(Event::SetupFinished { session: id, error });
                    });
                if let Err(err) = spawned {
                    warn!(session = %id, err = %err, "setup worker not started");
                    self.log
                        .push_error(format!("Session setup not started: {err}"), now);
                }
            }
            StartOutcome::Unavailable { .. } | StartOutcome::Failed { .. } => {
                self.log.push_error(self.status_line.clone(), now);
            }
        }
    }

    /// Tear down the current session and drop everything derived from it.
    fn clear_session(&mut self) {
        if self.sessions.teardown_session().is_none() {
            return;
        }
        if self.machine.is_running() {
            let transition = self.machine.force_stop();
            self.apply_transition(transition);
        }
        self.task_mark = 0;
        self.log.reset();
        self.status_line = "Session closed".to_string();
    }

    fn setup_finished(&mut self, session: SessionId, error: Option<String>) {
        if self.sessions.current_id() != Some(session) {
            debug!(session = %session, "setup result for old session ignored");
            return;
        }
        let now = self.clock.now_ms();
        match error {
            None => self.log.push_system("Session setup complete".to_string(), now),
            Some(err) => {
                self.status_line = format!("Session setup failed: {err}");
                self.log.push_error(self.status_line.clone(), now);
            }
        }
    }

    fn session_exited(&mut self, session: SessionId) {
        if !self.sessions.mark_exited(session) {
            return;
        }
        self.evaluate();
        if self.machine.is_running() {
            let transition = self.machine.transition_to_error();
            self.apply_transition(transition);
        }
        self.status_line = "Session exited".to_string();
    }

    fn dispatch(&mut self, text: &str) {
        let command = text.trim();
        let now = self.clock.now_ms();
        // The agent only starts after this point; it must find an empty mailbox.
        self.await_bridge_clear();

        if self.machine.is_running() && !command.is_empty() {
            match self.machine.transition_to_running(TaskDescriptor::new(command, now)) {
                Transition::Applied(_) => debug!("task already running; duplicate ignored"),
                Transition::Rejected { reason } => {
                    warn!(reason = %reason, "command rejected");
                    self.log.push_error(reason, now);
                }
            }
            return;
        }

        match self.sessions.dispatch_command(command) {
            DispatchOutcome::Sent { mark, .. } => {
                self.task_mark = mark;
                let transition = self.machine.transition_to_running(TaskDescriptor::new(command, now));
                self.apply_transition(transition);
            }
            DispatchOutcome::Rejected(DispatchRejection::Blank) => {}
            DispatchOutcome::Rejected(rejection) => {
                self.log.push_error(rejection.to_string(), now);
            }
        }
    }

    /// Delete the mailbox records on a worker thread.
    fn clear_bridge(&mut self) {
        self.await_bridge_clear();
        let bridge = Arc::clone(&self.bridge);
        let spawned = thread::Builder::new()
            .name("bridge-clear".to_string())
            .spawn(move || bridge.clear());
        match spawned {
            Ok(handle) => self.bridge_clear = Some(handle),
            Err(err) => {
                warn!(err = %err, "bridge clear worker not started; clearing inline");
                self.bridge.clear();
            }
        }
    }

    fn await_bridge_clear(&mut self) {
        if let Some(handle) = self.bridge_clear.take()
            && handle.join().is_err()
        {
            warn!("bridge clear worker panicked");
        }
    }

    fn agent_completed(&mut self, success: bool, reason: String) {
        if !self.machine.is_running() {
            debug!(success, "completion report with no running task discarded");
            return;
        }
        let transition = if success {
            self.machine.transition_to_success()
        } else {
            self.machine.transition_to_error()
        };
        self.apply_transition(transition);
        if !reason.trim().is_empty() {
            self.log.push_system(reason, self.clock.now_ms());
        }
    }

    fn apply_config(&mut self, config: OrchestratorConfig) {
        self.classifier =
            TaskProgressClassifier::new(&config.classifier.phrases, config.classifier.grace_ms);
        self.sessions
            .set_options(SessionOptions::from_config(&config, &self.root, &self.bridge));
        self.config = config;
        debug!(show_logs = self.config.ui.show_logs, "config applied");
    }

    /// Re-classify the running task's output and apply the signal.
    fn evaluate(&mut self) {
        let Some(task) = self.machine.current_task().cloned() else {
            return;
        };
        let Some(transcript) = self.sessions.transcript() else {
            return;
        };
        let elapsed = task.elapsed_ms(self.clock.now_ms());
        let signal = self
            .classifier
            .classify(transcript.since(self.task_mark), Some(&task), elapsed);
        self.apply_signal(signal, &task);
    }

    fn apply_signal(&mut self, signal: Signal, task: &TaskDescriptor) {
        // A stop or a newer task invalidates signals computed for `task`.
        if !self.machine.is_running_task(task) {
            debug!(?signal, "stale signal discarded");
            return;
        }
        let transition = match signal {
            Signal::Completed => self.machine.transition_to_success(),
            Signal::Failed => self.machine.transition_to_error(),
            Signal::StillRunning | Signal::NoChange => return,
        };
        self.apply_transition(transition);
    }

    fn apply_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Applied(outcome) if outcome.changed => {
                info!(status = outcome.status.label(), message = %outcome.message, "task state changed");
                self.status_line = outcome.message;
            }
            Transition::Applied(_) => {}
            Transition::Rejected { reason } => debug!(reason = %reason, "transition rejected"),
        }
    }

    fn publish(&mut self) {
        let task = self.machine.current_task().map(|task| task.command.clone());
        let (output, output_start) = self
            .sessions
            .transcript()
            .map_or(("", 0), |transcript| (transcript.text(), transcript.start()));
        self.log.observe(
            &Observation {
                output,
                output_start,
                status_line: &self.status_line,
                task: task.as_deref(),
                task_status: self.machine.status(),
                running: self.machine.is_running(),
            },
            self.clock.now_ms(),
        );

        let snapshot = self.snapshot();
        if self.last_published.as_ref() == Some(&snapshot) {
            return;
        }
        for observer in &mut self.observers {
            if let Err(err) = observer.status_changed(&snapshot) {
                warn!(err = %format!("{err:#}"), "status observer failed");
            }
        }
        self.last_published = Some(snapshot);
    }
}

impl<H: SessionHost> Drop for Orchestrator<H> {
    fn drop(&mut self) {
        self.sessions.teardown_session();
    }
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::StartSession => "start_session",
        Event::Output { .. } => "output",
        Event::SessionExited { .. } => "session_exited",
        Event::SetupFinished { .. } => "setup_finished",
        Event::Dispatch(_) => "dispatch",
        Event::Stop => "stop",
        Event::Reset => "reset",
        Event::ActionHandled { .. } => "action_handled",
        Event::AgentCompleted { .. } => "agent_completed",
        Event::ConfigChanged(_) => "config_changed",
        Event::Tick => "tick",
        Event::Shutdown => "shutdown",
    }
}

/// One-line summary of a snapshot for terminal display.
pub fn describe(snapshot: &StatusSnapshot) -> String {
    match (&snapshot.state, &snapshot.task) {
        (TaskStatus::Running, Some(task)) => format!("running: {task}"),
        (state, _) => format!("{}: {}", state.label(), snapshot.status_line),
    }
}
