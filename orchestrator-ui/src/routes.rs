//! HTTP route handlers for the UI API.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use orchestrator::core::types::StatusSnapshot;
use orchestrator::io::bridge::AgentBridge;
use orchestrator::io::config::{OrchestratorConfig, load_config};
use orchestrator::io::status_store::read_status;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/config", get(get_config))
        .route("/bridge/device-state", get(get_device_state))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status - the last snapshot the orchestrator persisted.
async fn get_status(State(state): State<AppState>) -> Result<Json<StatusSnapshot>, StatusCode> {
    let path = &state.paths.status_path;
    if !path.exists() {
        return Err(StatusCode::NOT_FOUND);
    }
    read_status(path).map(Json).map_err(|err| {
        warn!(err = %format!("{err:#}"), "status unreadable");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// GET /api/config - effective configuration (defaults when no file exists).
async fn get_config(State(state): State<AppState>) -> Result<Json<OrchestratorConfig>, StatusCode> {
    load_config(&state.paths.config_path).map(Json).map_err(|err| {
        warn!(err = %format!("{err:#}"), "config unreadable");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[derive(Debug, Serialize)]
struct DeviceStateView {
    formatted_text: String,
    focused_text: String,
    element_count: usize,
    element_tree: Value,
    phone_state: Value,
    timestamp: i64,
}

/// GET /api/bridge/device-state - peek at the published device state.
///
/// Reading does not consume the record; the agent still sees it.
async fn get_device_state(
    State(state): State<AppState>,
) -> Result<Json<DeviceStateView>, StatusCode> {
    let bridge = AgentBridge::new(state.bridge_dir());
    let device = bridge.read_device_state().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(DeviceStateView {
        element_count: device.element_count(),
        element_tree: device.element_tree().unwrap_or(Value::Null),
        phone_state: device.phone_state().unwrap_or(Value::Null),
        formatted_text: device.formatted_text,
        focused_text: device.focused_text,
        timestamp: device.timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::core::types::TaskStatus;
    use orchestrator::io::bridge::DeviceState;
    use orchestrator::io::init::{InitOptions, init_layout};
    use serde_json::json;

    fn initialized() -> (tempfile::TempDir, AppState) {
        let temp = tempfile::tempdir().expect("tempdir");
        init_layout(temp.path(), &InitOptions { force: false }).expect("init");
        let state = AppState::new(temp.path().to_path_buf());
        (temp, state)
    }

    #[tokio::test]
    async fn status_reads_persisted_snapshot() {
        let (_temp, state) = initialized();
        let Json(snapshot) = get_status(State(state)).await.expect("status");
        assert_eq!(snapshot.state, TaskStatus::Idle);
        assert_eq!(snapshot.status_line, "Idle");
    }

    #[tokio::test]
    async fn status_missing_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(temp.path().to_path_buf());
        let err = get_status(State(state)).await.expect_err("missing");
        assert_eq!(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_falls_back_to_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(temp.path().to_path_buf());
        let Json(config) = get_config(State(state)).await.expect("config");
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[tokio::test]
    async fn device_state_peek_leaves_record_in_place() {
        let (_temp, state) = initialized();
        let bridge = AgentBridge::new(state.bridge_dir());
        let tree = json!([{ "text": "Settings", "children": [{ "text": "Wi-Fi" }] }]);
        let device = DeviceState::new("home", "Settings", &tree, &json!({ "battery": 80 }), 7);
        assert!(bridge.publish_device_state(&device));

        let Json(view) = get_device_state(State(state.clone())).await.expect("device state");
        assert_eq!(view.element_count, 2);
        assert_eq!(view.phone_state["battery"], 80);
        assert!(bridge.read_device_state().is_some());
    }

    #[tokio::test]
    async fn device_state_absent_is_not_found() {
        let (_temp, state) = initialized();
        let err = get_device_state(State(state)).await.expect_err("absent");
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
