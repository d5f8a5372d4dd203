//! Server-Sent Events stream and file watcher.

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use orchestrator::io::bridge::DEVICE_STATE_FILE;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct SsePayload {
    #[serde(rename = "type")]
    event_type: &'static str,
}

impl From<ChangeEvent> for SsePayload {
    fn from(event: ChangeEvent) -> Self {
        let event_type = match event {
            ChangeEvent::StatusChanged => "status_changed",
            ChangeEvent::ConfigChanged => "config_changed",
            ChangeEvent::DeviceStateChanged => "device_state_changed",
        };
        SsePayload { event_type }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    let payload = SsePayload::from(change_event);
                    if let Ok(json) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

/// Files whose changes clients hear about.
struct Watched {
    status: PathBuf,
    config: PathBuf,
    device_state: PathBuf,
}

impl Watched {
    fn for_state(state: &AppState) -> Self {
        Self {
            status: state.paths.status_path.clone(),
            config: state.paths.config_path.clone(),
            device_state: state.bridge_dir().join(DEVICE_STATE_FILE),
        }
    }
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    let watched = Watched::for_state(&state);
    let mut dirs = vec![state.paths.orchestrator_dir.clone()];
    if let Some(bridge_dir) = watched.device_state.parent()
        && !bridge_dir.starts_with(&state.paths.orchestrator_dir)
    {
        dirs.push(bridge_dir.to_path_buf());
    }
    for dir in &dirs {
        if dir.exists() {
            watcher.watch(dir, RecursiveMode::Recursive)?;
            info!(path = %dir.display(), "watching directory");
        }
    }

    // Batch at a fixed interval; the orchestrator rewrites status often while a task runs.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &watched, &pending_events);
                pending_events.clear();
            }
        }
    }
}

fn process_events(state: &AppState, watched: &Watched, events: &[NotifyEvent]) {
    let mut status_changed = false;
    let mut config_changed = false;
    let mut device_state_changed = false;

    for event in events {
        // Atomic writes land as a rename, which some backends report as Create.
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            if path == &watched.status {
                status_changed = true;
            } else if path == &watched.config {
                config_changed = true;
            } else if path == &watched.device_state {
                device_state_changed = true;
            }
        }
    }

    for (changed, change) in [
        (status_changed, ChangeEvent::StatusChanged),
        (config_changed, ChangeEvent::ConfigChanged),
        (device_state_changed, ChangeEvent::DeviceStateChanged),
    ] {
        if changed {
            debug!(?change, "broadcasting change");
            let _ = state.event_tx.send(change);
        }
    }
}
