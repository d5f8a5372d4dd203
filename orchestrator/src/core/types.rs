//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// Identity of one shell session, allocated from a monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A task in flight: the literal command handed to the agent and when it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub command: String,
    /// Wall-clock start in milliseconds since the Unix epoch.
    pub started_at_ms: i64,
}

impl TaskDescriptor {
    pub fn new(command: impl Into<String>, started_at_ms: i64) -> Self {
        Self {
            command: command.into(),
            started_at_ms,
        }
    }

    /// Milliseconds since the task started, saturating at zero for clock skew.
    pub fn elapsed_ms(&self, now_ms: i64) -> u64 {
        u64::try_from(now_ms.saturating_sub(self.started_at_ms)).unwrap_or(0)
    }

    /// Whether `other` names the same task, ignoring when it was (re)issued.
    pub fn same_task(&self, other: &TaskDescriptor) -> bool {
        self.command == other.command
    }
}

/// Task lifecycle. Only `Running` carries a task, so a finished state with a
/// dangling task cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    Idle,
    Running(TaskDescriptor),
    Success,
    Error,
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Idle => TaskStatus::Idle,
            TaskState::Running(_) => TaskStatus::Running,
            TaskState::Success => TaskStatus::Success,
            TaskState::Error => TaskStatus::Error,
        }
    }

    pub fn task(&self) -> Option<&TaskDescriptor> {
        match self {
            TaskState::Running(task) => Some(task),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running(_))
    }
}

/// Externally visible lifecycle label (no payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Success,
    Error,
}

impl TaskStatus {
    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        }
    }
}

/// Lifecycle signal inferred from streamed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Completed,
    Failed,
    StillRunning,
    NoChange,
}

/// Category of a user-facing log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    System,
    Output,
    Error,
}

/// One entry in the ordered, append-only message sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub kind: MessageKind,
    pub text: String,
    pub timestamp: i64,
}

/// Everything the UI collaborator is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: TaskStatus,
    pub task: Option<String>,
    pub running: bool,
    pub status_line: String,
    pub show_logs: bool,
    pub session: Option<SessionId>,
    pub messages: Vec<LogMessage>,
}

/// Source of wall-clock milliseconds. Injected so elapsed-time decisions stay testable.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_saturates_on_clock_skew() {
        let task = TaskDescriptor::new("open settings", 5_000);
        assert_eq!(task.elapsed_ms(7_500), 2_500);
        assert_eq!(task.elapsed_ms(1_000), 0);
    }

    #[test]
    fn only_running_exposes_a_task() {
        let task = TaskDescriptor::new("a", 0);
        assert_eq!(TaskState::Running(task.clone()).task(), Some(&task));
        assert_eq!(TaskState::Success.task(), None);
        assert_eq!(TaskState::Error.status(), TaskStatus::Error);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Running).expect("serialize");
        assert_eq!(json, "\"running\"");
    }
}
