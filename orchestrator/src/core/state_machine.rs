//! Validated task lifecycle transitions.
//!
//! Legal edges:
//! - `Idle | Success | Error -> Running` (start a task)
//! - `Running(t) -> Running(t)` (duplicate confirmation, no-op)
//! - `Running -> Success | Error` (terminal outcome)
//! - `* -> Idle` (stop / reset)
//!
//! Every other request is answered with [`Transition::Rejected`]; nothing here
//! panics or returns an error.

use crate::core::types::{TaskDescriptor, TaskState, TaskStatus};

/// Payload of an applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub status: TaskStatus,
    pub message: String,
    pub running: bool,
    /// False when the request only confirmed the current state.
    pub changed: bool,
}

/// Result of a transition request. Callers must inspect the tag.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(TransitionOutcome),
    Rejected { reason: String },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn outcome(&self) -> Option<&TransitionOutcome> {
        match self {
            Transition::Applied(outcome) => Some(outcome),
            Transition::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskStateMachine {
    state: TaskState,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn current_task(&self) -> Option<&TaskDescriptor> {
        self.state.task()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Whether the machine already reflects `task` as running.
    pub fn is_running_task(&self, task: &TaskDescriptor) -> bool {
        self.current_task().is_some_and(|current| current.same_task(task))
    }

    pub fn transition_to_running(&mut self, task: TaskDescriptor) -> Transition {
        match &self.state {
            TaskState::Running(current) if current.same_task(&task) => {
                Transition::Applied(TransitionOutcome {
                    status: TaskStatus::Running,
                    message: format!("Running: {}", current.command),
                    running: true,
                    changed: false,
                })
            }
            TaskState::Running(current) => Transition::Rejected {
                reason: format!(
                    "cannot start '{}' while '{}' is running",
                    task.command, current.command
                ),
            },
            TaskState::Idle | TaskState::Success | TaskState::Error => {
                let message = format!("Running: {}", task.command);
                self.state = TaskState::Running(task);
                applied(TaskStatus::Running, message)
            }
        }
    }

    pub fn transition_to_success(&mut self) -> Transition {
        self.finish(TaskState::Success, "Task completed")
    }

    pub fn transition_to_error(&mut self) -> Transition {
        self.finish(TaskState::Error, "Task failed")
    }

    /// User-requested stop. Always accepted; drops the task immediately.
    pub fn force_stop(&mut self) -> Transition {
        let message = match &self.state {
            TaskState::Running(task) => format!("Stopped: {}", task.command),
            _ => "Stopped".to_string(),
        };
        self.state = TaskState::Idle;
        applied(TaskStatus::Idle, message)
    }

    /// Reset to idle from any state.
    pub fn transition_to_idle(&mut self) -> Transition {
        self.state = TaskState::Idle;
        applied(TaskStatus::Idle, "Idle".to_string())
    }

    fn finish(&mut self, next: TaskState, message: &str) -> Transition {
        if !self.state.is_running() {
            return Transition::Rejected {
                reason: format!(
                    "cannot move to {} from {}: no task is running",
                    next.status().label(),
                    self.state.status().label()
                ),
            };
        }
        let status = next.status();
        self.state = next;
        applied(status, message.to_string())
    }
}

fn applied(status: TaskStatus, message: String) -> Transition {
    Transition::Applied(TransitionOutcome {
        status,
        message,
        running: status == TaskStatus::Running,
        changed: true,
    })
}
