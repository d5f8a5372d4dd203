//! Process host that runs interactive shell sessions for the agent.
//!
//! [`SessionHost`] is the seam the session manager talks to. The host offers a
//! primary creation path and an alternate construction path; sessions built
//! through the alternate path must be registered explicitly before use.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, instrument, warn};

use crate::core::types::SessionId;
use crate::io::process::{pump_output, run_command_with_timeout, wait_or_kill};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const EXIT_POLL: Duration = Duration::from_millis(20);

/// What to launch for one session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub id: SessionId,
    pub shell: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Terminal emulation geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
    pub cell_width_px: u16,
    pub cell_height_px: u16,
}

impl Geometry {
    fn pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: self.cols.saturating_mul(self.cell_width_px),
            pixel_height: self.rows.saturating_mul(self.cell_height_px),
        }
    }
}

/// Something a running session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Data(String),
    Exited,
}

type Deliver = dyn Fn(SessionId, SessionOutput) + Send + Sync;

/// Streaming-output callback installed on a session. Tags every event with the
/// session id so late output from a torn-down session can be told apart.
#[derive(Clone)]
pub struct OutputSink {
    id: SessionId,
    deliver: Arc<Deliver>,
}

impl OutputSink {
    pub fn new(id: SessionId, deliver: impl Fn(SessionId, SessionOutput) + Send + Sync + 'static) -> Self {
        Self {
            id,
            deliver: Arc::new(deliver),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn data(&self, text: String) {
        (self.deliver)(self.id, SessionOutput::Data(text));
    }

    pub fn exited(&self) {
        (self.deliver)(self.id, SessionOutput::Exited);
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").field("id", &self.id).finish()
    }
}

/// Shared handle to a session's input stream. Cloned into setup workers.
#[derive(Clone)]
pub struct SessionInput {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SessionInput {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write `text` followed by a newline and flush.
    pub fn write_line(&self, text: &str) -> Result<()> {
        self.write_raw(&format!("{text}\n"))
    }

    pub fn write_raw(&self, text: &str) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(text.as_bytes())
            .context("write session input")?;
        writer.flush().context("flush session input")
    }
}

impl std::fmt::Debug for SessionInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionInput")
    }
}

/// A live session owned by the session manager.
pub trait HostedSession: Send {
    fn input(&self) -> SessionInput;
    fn initialize_emulator(&mut self, geometry: Geometry) -> Result<()>;
    /// Ask the session to end and release its resources, waiting at most `timeout`.
    fn finish(&mut self, timeout: Duration) -> Result<()>;
}

pub trait SessionHost {
    type Session: HostedSession;

    fn is_available(&self) -> bool;

    /// Primary path: create and register a session in one step.
    fn create_session(&mut self, spec: &SessionSpec, sink: OutputSink) -> Result<Self::Session>;

    /// Alternate path: build a session without registering it.
    fn construct_session(&mut self, spec: &SessionSpec, sink: OutputSink) -> Result<Self::Session>;

    /// Add a constructed session to the host's registry.
    fn register_session(&mut self, id: SessionId) -> Result<()>;

    fn release_session(&mut self, id: SessionId);
}

/// Hosts sessions in a pseudo-terminal, falling back to plain pipes.
#[derive(Debug)]
pub struct PtyHost {
    shell: String,
    registry: BTreeSet<SessionId>,
}

impl PtyHost {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            registry: BTreeSet::new(),
        }
    }

    pub fn registered(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.registry.iter().copied()
    }
}

impl SessionHost for PtyHost {
    type Session = HostSession;

    fn is_available(&self) -> bool {
        let mut probe = Command::new(&self.shell);
        probe.args(["-c", "exit 0"]);
        match run_command_with_timeout(probe, PROBE_TIMEOUT, 1024) {
            Ok(output) => output.status.success(),
            Err(err) => {
                warn!(shell = %self.shell, err = %format!("{err:#}"), "session host probe failed");
                false
            }
        }
    }

    #[instrument(skip_all, fields(session = %spec.id))]
    fn create_session(&mut self, spec: &SessionSpec, sink: OutputSink) -> Result<HostSession> {
        let session = spawn_pty(spec, sink)?;
        self.registry.insert(spec.id);
        Ok(session)
    }

    #[instrument(skip_all, fields(session = %spec.id))]
    fn construct_session(&mut self, spec: &SessionSpec, sink: OutputSink) -> Result<HostSession> {
        spawn_piped(spec, sink)
    }

    fn register_session(&mut self, id: SessionId) -> Result<()> {
        if !self.registry.insert(id) {
            return Err(anyhow!("{id} is already registered"));
        }
        debug!(session = %id, "session registered");
        Ok(())
    }

    fn release_session(&mut self, id: SessionId) {
        self.registry.remove(&id);
    }
}

/// Session created by [`PtyHost`].
pub struct HostSession {
    input: SessionInput,
    backend: Backend,
}

enum Backend {
    Pty {
        master: Box<dyn MasterPty + Send>,
        child: Box<dyn portable_pty::Child + Send + Sync>,
    },
    Piped {
        child: Child,
    },
}

impl HostedSession for HostSession {
    fn input(&self) -> SessionInput {
        self.input.clone()
    }

    fn initialize_emulator(&mut self, geometry: Geometry) -> Result<()> {
        match &self.backend {
            Backend::Pty { master, .. } => master
                .resize(geometry.pty_size())
                .map_err(|err| anyhow!("resize pty: {err}")),
            Backend::Piped { .. } => Ok(()),
        }
    }

    fn finish(&mut self, timeout: Duration) -> Result<()> {
        if let Err(err) = self.input.write_line("exit") {
            debug!(err = %format!("{err:#}"), "exit request not delivered");
        }
        match &mut self.backend {
            Backend::Pty { child, .. } => {
                let deadline = Instant::now() + timeout;
                loop {
                    if child.try_wait().context("poll pty child")?.is_some() {
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        warn!("pty child still running, killing");
                        child.kill().context("kill pty child")?;
                        child.wait().context("wait pty child after kill")?;
                        return Ok(());
                    }
                    thread::sleep(EXIT_POLL);
                }
            }
            Backend::Piped { child } => {
                wait_or_kill(child, timeout)?;
                Ok(())
            }
        }
    }
}

fn spawn_pty(spec: &SessionSpec, sink: OutputSink) -> Result<HostSession> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| anyhow!("open pty: {err}"))?;

    let mut cmd = CommandBuilder::new(&spec.shell);
    cmd.args(&spec.args);
    cmd.cwd(&spec.workdir);
    // CommandBuilder starts from an empty environment.
    for (key, value) in std::env::vars() {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|err| anyhow!("spawn {} in pty: {err}", spec.shell))?;
    info!(pid = ?child.process_id(), shell = %spec.shell, "pty session spawned");

    let writer = pair
        .master
        .take_writer()
        .map_err(|err| anyhow!("take pty writer: {err}"))?;
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| anyhow!("clone pty reader: {err}"))?;

    spawn_reader(reader, sink)?;

    Ok(HostSession {
        input: SessionInput::new(writer),
        backend: Backend::Pty {
            master: pair.master,
            child,
        },
    })
}

fn spawn_piped(spec: &SessionSpec, sink: OutputSink) -> Result<HostSession> {
    let mut cmd = Command::new(&spec.shell);
    cmd.args(&spec.args)
        .current_dir(&spec.workdir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {} with pipes", spec.shell))?;
    info!(pid = child.id(), shell = %spec.shell, "piped session spawned");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    // Only stdout reports the exit; stderr just contributes text.
    let err_sink = sink.clone();
    thread::Builder::new()
        .name(format!("{}-stderr", sink.id()))
        .spawn(move || {
            pump_output(stderr, |text| err_sink.data(text));
        })
        .context("spawn stderr reader")?;
    spawn_reader(Box::new(stdout), sink)?;

    Ok(HostSession {
        input: SessionInput::new(Box::new(stdin)),
        backend: Backend::Piped { child },
    })
}

fn spawn_reader(reader: Box<dyn std::io::Read + Send>, sink: OutputSink) -> Result<()> {
    thread::Builder::new()
        .name(format!("{}-output", sink.id()))
        .spawn(move || {
            let bytes = pump_output(reader, |text| sink.data(text));
            debug!(session = %sink.id(), bytes, "session output ended");
            sink.exited();
        })
        .context("spawn output reader")?;
    Ok(())
}
