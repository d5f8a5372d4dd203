//! Task execution orchestrator CLI.
//!
//! Runs the automation agent in a shell session, tracks task progress and
//! exposes the agent mailbox (`.orchestrator/bridge/`) for inspection.

use std::collections::BTreeMap;
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use orchestrator::core::classifier::TaskProgressClassifier;
use orchestrator::core::types::{
    Clock, MessageKind, Signal, StatusSnapshot, SystemClock, TaskDescriptor,
};
use orchestrator::exit_codes;
use orchestrator::io::bridge::{ActionResult, AgentBridge, DeviceState};
use orchestrator::io::bridge_worker::{BridgeWorker, SnapshotFileCollaborator};
use orchestrator::io::config::{ConfigStore, OrchestratorConfig, load_config};
use orchestrator::io::host::{PtyHost, SessionHost};
use orchestrator::io::init::{InitOptions, OrchestratorPaths, init_layout};
use orchestrator::io::status_store::{StatusFileSink, StatusObserver, read_status};
use orchestrator::logging;
use orchestrator::orchestrator::{Event, Orchestrator, describe};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Run a shell-hosted automation agent and track its tasks"
)]
struct Cli {
    /// Project root containing `.orchestrator/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Increase diagnostic output on stderr (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` with default config and an idle status.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a session and read tasks from stdin, one per line.
    ///
    /// Lines starting with `:` are controls: `:stop`, `:reset`, `:restart`,
    /// `:logs`, `:status`, `:quit`.
    Run {
        /// Do not serve the agent mailbox.
        #[arg(long)]
        no_bridge: bool,
    },
    /// Print the last published status snapshot as JSON.
    Status,
    /// Classify text from stdin as task output.
    Classify {
        /// Milliseconds since the task started.
        #[arg(long, default_value_t = 0)]
        elapsed_ms: u64,
        /// Task the output belongs to; without it nothing is in flight.
        #[arg(long)]
        task: Option<String>,
    },
    /// Inspect or drive the agent mailbox.
    Bridge {
        #[command(subcommand)]
        command: BridgeCommand,
    },
}

#[derive(Subcommand)]
enum BridgeCommand {
    /// Print the current device state without consuming it.
    State,
    /// Replace the device state.
    PublishState {
        #[arg(long, default_value = "")]
        formatted: String,
        #[arg(long, default_value = "")]
        focused: String,
        /// Element tree as JSON.
        #[arg(long, default_value = "[]")]
        tree: String,
        /// Phone state as JSON.
        #[arg(long, default_value = "{}")]
        phone: String,
    },
    /// Submit a pending action as the agent would.
    SendAction {
        action_type: String,
        /// Parameter as `key=value`; repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Take (and delete) the pending action.
    TakeAction,
    /// Publish the result for an action.
    PublishResult {
        #[arg(long)]
        action_id: String,
        #[arg(long, default_value = "")]
        result: String,
        /// Mark the action failed with this error.
        #[arg(long)]
        error: Option<String>,
    },
    /// Take (and delete) the action result.
    TakeResult,
    /// Delete all mailbox records.
    Clear,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run { no_bridge } => cmd_run(&root, no_bridge),
        Command::Status => cmd_status(&root),
        Command::Classify { elapsed_ms, task } => cmd_classify(&root, elapsed_ms, task),
        Command::Bridge { command } => cmd_bridge(&root, command),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_layout(root, &InitOptions { force })?;
    println!("initialized {}", paths.orchestrator_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path) -> Result<i32> {
    let paths = OrchestratorPaths::new(root);
    let snapshot = read_status(&paths.status_path)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(exit_codes::OK)
}

fn cmd_classify(root: &Path, elapsed_ms: u64, task: Option<String>) -> Result<i32> {
    let config = load_config(&OrchestratorPaths::new(root).config_path)?;
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("read stdin")?;
    let classifier =
        TaskProgressClassifier::new(&config.classifier.phrases, config.classifier.grace_ms);
    let task = task.map(|command| TaskDescriptor::new(command, 0));
    let signal = classifier.classify(&text, task.as_ref(), elapsed_ms);
    println!("{}", signal_name(signal));
    Ok(exit_codes::OK)
}

fn signal_name(signal: Signal) -> &'static str {
    match signal {
        Signal::Completed => "completed",
        Signal::Failed => "failed",
        Signal::StillRunning => "still_running",
        Signal::NoChange => "no_change",
    }
}

fn cmd_bridge(root: &Path, command: BridgeCommand) -> Result<i32> {
    let config = load_config(&OrchestratorPaths::new(root).config_path)?;
    let bridge = AgentBridge::new(config.bridge_dir(root));
    let now = SystemClock.now_ms();

    match command {
        BridgeCommand::State => print_or_no_message(bridge.read_device_state()),
        BridgeCommand::PublishState {
            formatted,
            focused,
            tree,
            phone,
        } => {
            let tree: Value = serde_json::from_str(&tree).context("parse --tree json")?;
            let phone: Value = serde_json::from_str(&phone).context("parse --phone json")?;
            let state = DeviceState::new(formatted, focused, &tree, &phone, now);
            if !bridge.publish_device_state(&state) {
                bail!("device state not written to {}", bridge.dir().display());
            }
            Ok(exit_codes::OK)
        }
        BridgeCommand::SendAction {
            action_type,
            params,
        } => {
            let params: BTreeMap<String, String> = params.into_iter().collect();
            let action = bridge
                .submit_action(&action_type, params, now)
                .ok_or_else(|| anyhow!("action not written to {}", bridge.dir().display()))?;
            println!("{}", action.action_id);
            Ok(exit_codes::OK)
        }
        BridgeCommand::TakeAction => print_or_no_message(bridge.take_pending_action()),
        BridgeCommand::PublishResult {
            action_id,
            result,
            error,
        } => {
            let record = match error {
                Some(error) => ActionResult::failed(action_id, error, now),
                None => ActionResult::ok(action_id, result, now),
            };
            if !bridge.publish_action_result(&record) {
                bail!("action result not written to {}", bridge.dir().display());
            }
            Ok(exit_codes::OK)
        }
        BridgeCommand::TakeResult => print_or_no_message(bridge.take_action_result()),
        BridgeCommand::Clear => {
            bridge.clear();
            Ok(exit_codes::OK)
        }
    }
}

fn print_or_no_message<T: serde::Serialize>(record: Option<T>) -> Result<i32> {
    match record {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(exit_codes::OK)
        }
        None => Ok(exit_codes::NO_MESSAGE),
    }
}

/// Prints log messages to stdout as they are appended.
struct ConsoleObserver {
    printed: usize,
}

impl StatusObserver for ConsoleObserver {
    fn status_changed(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        if snapshot.messages.len() < self.printed {
            self.printed = 0;
        }
        if snapshot.show_logs {
            for message in &snapshot.messages[self.printed..] {
                let tag = match message.kind {
                    MessageKind::User => ">",
                    MessageKind::System => "*",
                    MessageKind::Output => " ",
                    MessageKind::Error => "!",
                };
                println!("{tag} {}", message.text);
            }
        }
        self.printed = snapshot.messages.len();
        Ok(())
    }
}

fn cmd_run(root: &Path, no_bridge: bool) -> Result<i32> {
    let paths = OrchestratorPaths::new(root);
    let mut store = ConfigStore::open(&paths.config_path)?;
    let config = store.get().clone();

    let host = PtyHost::new(config.session.shell.clone());
    if !host.is_available() {
        eprintln!("session host unavailable: {}", config.session.shell);
        return Ok(exit_codes::HOST_UNAVAILABLE);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut orchestrator = Orchestrator::new(root, config.clone(), host, Arc::clone(&clock));
    orchestrator.add_observer(StatusFileSink::new(&paths.status_path));
    orchestrator.add_observer(ConsoleObserver { printed: 0 });
    let tx = orchestrator.sender();

    let config_tx = tx.clone();
    store.subscribe(move |cfg: &OrchestratorConfig| {
        let _ = config_tx.send(Event::ConfigChanged(Box::new(cfg.clone())));
    });

    let stop = Arc::new(AtomicBool::new(false));
    let worker = if no_bridge {
        None
    } else {
        let source = config
            .bridge
            .device_state_source
            .as_ref()
            .map(|path| root.join(path));
        let worker = BridgeWorker::new(
            orchestrator.bridge(),
            SnapshotFileCollaborator::new(source),
            clock,
            Duration::from_millis(config.bridge.poll_interval_ms),
        );
        let worker_tx = tx.clone();
        Some(worker.spawn(Arc::clone(&stop), move |event| {
            let _ = worker_tx.send(Event::from(event));
        })?)
    };

    tx.send(Event::StartSession)
        .map_err(|_| anyhow!("orchestrator loop closed"))?;
    let event_loop = thread::Builder::new()
        .name("orchestrator".to_string())
        .spawn(move || orchestrator.run())
        .context("spawn orchestrator loop")?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("read stdin")?;
        let event = match line.trim() {
            ":quit" => break,
            ":stop" => Event::Stop,
            ":reset" => Event::Reset,
            ":restart" => Event::StartSession,
            ":logs" => {
                store.update(|cfg| cfg.ui.show_logs = !cfg.ui.show_logs)?;
                continue;
            }
            ":status" => {
                match read_status(&paths.status_path) {
                    Ok(snapshot) => println!("{}", describe(&snapshot)),
                    Err(err) => eprintln!("{err:#}"),
                }
                continue;
            }
            _ => Event::Dispatch(line),
        };
        if tx.send(event).is_err() {
            break;
        }
    }

    let _ = tx.send(Event::Shutdown);
    let result = event_loop
        .join()
        .map_err(|_| anyhow!("orchestrator loop panicked"))?;
    stop.store(true, Ordering::SeqCst);
    if let Some(worker) = worker {
        worker
            .join()
            .map_err(|_| anyhow!("bridge worker panicked"))?;
    }
    result?;
    Ok(exit_codes::OK)
}
