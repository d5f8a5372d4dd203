//! Turns raw session output and status changes into user-facing log messages.
//!
//! The manager remembers the last value it saw for each observed field and only
//! reacts to changes. Output is tracked by absolute transcript position, so each
//! chunk of agent text is recorded once even after the transcript is trimmed.

use crate::core::types::{LogMessage, MessageKind, TaskStatus};

/// Lines mentioning credential provisioning never reach the user log.
const DENYLIST: &[&str] = &[
    "api_key",
    "api key",
    "apikey",
    "access token",
    "secret",
    "password",
    "credential",
];

/// Lines that read well on their own; when present, only these are shown.
const ALLOWLIST: &[&str] = &[
    "goal",
    "task",
    "step",
    "action",
    "thinking",
    "planning",
    "executing",
    "tapping",
    "swiping",
    "typing",
    "opening",
    "completed",
    "success",
    "failed",
    "error",
];

const ERROR_MARKERS: &[&str] = &["error", "failed", "exception", "traceback"];

/// One observation of the orchestrator's visible state.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    /// Retained transcript text.
    pub output: &'a str,
    /// Absolute position of the first byte of `output`.
    pub output_start: u64,
    pub status_line: &'a str,
    pub task: Option<&'a str>,
    pub task_status: TaskStatus,
    pub running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogMessageManager {
    /// Absolute position just past the last output recorded.
    last_output_end: Option<u64>,
    last_status_line: Option<String>,
    last_task: Option<String>,
    last_task_status: Option<TaskStatus>,
    last_running: Option<bool>,
    messages: Vec<LogMessage>,
}

impl LogMessageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[LogMessage] {
        &self.messages
    }

    /// Compare against the last observation and append messages for whatever changed.
    ///
    /// Returns the number of messages appended.
    pub fn observe(&mut self, observation: &Observation<'_>, now_ms: i64) -> usize {
        let before = self.messages.len();

        if self.last_task.as_deref() != observation.task {
            if let Some(task) = observation.task {
                self.push(MessageKind::User, task.to_string(), now_ms);
            }
            self.last_task = observation.task.map(str::to_string);
        }

        let output_end = observation.output_start + observation.output.len() as u64;
        if self.last_output_end != Some(output_end) {
            let delta = output_delta(self.last_output_end, observation.output_start, observation.output);
            self.record_output(delta, now_ms);
            self.last_output_end = Some(output_end);
        }

        if self.last_status_line.as_deref() != Some(observation.status_line) {
            if !observation.status_line.trim().is_empty() {
                self.push_system(observation.status_line.to_string(), now_ms);
            }
            self.last_status_line = Some(observation.status_line.to_string());
        }

        if self.last_task_status != Some(observation.task_status) {
            if self.last_task_status.is_some() {
                self.push_system(status_message(observation.task_status), now_ms);
            }
            self.last_task_status = Some(observation.task_status);
        }

        self.last_running = Some(observation.running);

        self.messages.len() - before
    }

    /// Append a system message unless it repeats the previous message verbatim.
    pub fn push_system(&mut self, text: String, now_ms: i64) {
        if let Some(last) = self.messages.last()
            && last.kind == MessageKind::System
            && last.text == text
        {
            return;
        }
        self.push(MessageKind::System, text, now_ms);
    }

    pub fn push_error(&mut self, text: String, now_ms: i64) {
        self.push(MessageKind::Error, text, now_ms);
    }

    /// Forget last-seen values; the next observation is diffed from scratch.
    pub fn reset(&mut self) {
        self.last_output_end = None;
        self.last_status_line = None;
        self.last_task = None;
        self.last_task_status = None;
        self.last_running = None;
    }

    /// Reset trackers and drop the message history.
    pub fn clear(&mut self) {
        self.reset();
        self.messages.clear();
    }

    pub fn last_running(&self) -> Option<bool> {
        self.last_running
    }

    fn record_output(&mut self, delta: &str, now_ms: i64) {
        let kept: Vec<&str> = delta
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .filter(|line| !contains_any(line, DENYLIST))
            .collect();
        if kept.is_empty() {
            return;
        }

        let friendly: Vec<&str> = kept
            .iter()
            .copied()
            .filter(|line| contains_any(line, ALLOWLIST))
            .collect();

        if friendly.is_empty() {
            self.push(MessageKind::Output, kept.join("\n"), now_ms);
            return;
        }

        for line in friendly {
            let kind = if contains_any(line, ERROR_MARKERS) {
                MessageKind::Error
            } else {
                MessageKind::Output
            };
            self.push(kind, line.trim().to_string(), now_ms);
        }
    }

    fn push(&mut self, kind: MessageKind, text: String, timestamp: i64) {
        self.messages.push(LogMessage {
            kind,
            text,
            timestamp,
        });
    }
}

/// Text of `output` (starting at absolute `start`) past `last_end`.
///
/// All of `output` is new when nothing was seen yet, when text between
/// `last_end` and `start` was trimmed unseen, or when positions restarted.
pub fn output_delta(last_end: Option<u64>, start: u64, output: &str) -> &str {
    let Some(last_end) = last_end else {
        return output;
    };
    let Some(offset) = last_end
        .checked_sub(start)
        .and_then(|offset| usize::try_from(offset).ok())
        .filter(|offset| *offset <= output.len())
    else {
        return output;
    };
    let mut offset = offset;
    while !output.is_char_boundary(offset) {
        offset += 1;
    }
    &output[offset..]
}

fn contains_any(line: &str, needles: &[&str]) -> bool {
    let lowered = line.to_lowercase();
    needles.iter().any(|needle| lowered.contains(needle))
}

fn status_message(status: TaskStatus) -> String {
    match status {
        TaskStatus::Idle => "Agent idle".to_string(),
        TaskStatus::Running => "Agent running".to_string(),
        TaskStatus::Success => "Task completed".to_string(),
        TaskStatus::Error => "Task failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(output: &str) -> Observation<'_> {
        Observation {
            output,
            output_start: 0,
            status_line: "",
            task: None,
            task_status: TaskStatus::Idle,
            running: false,
        }
    }

    fn texts(manager: &LogMessageManager) -> Vec<(MessageKind, &str)> {
        manager
            .messages()
            .iter()
            .map(|m| (m.kind, m.text.as_str()))
            .collect()
    }

    #[test]
    fn delta_starts_at_last_recorded_position() {
        assert_eq!(output_delta(None, 0, "abc"), "abc");
        assert_eq!(output_delta(Some(3), 0, "abcdef"), "def");
        assert_eq!(output_delta(Some(12), 10, "cdef"), "ef");
        // Text between 5 and 10 was trimmed before it was seen.
        assert_eq!(output_delta(Some(5), 10, "cdef"), "cdef");
        // A new transcript restarts positions.
        assert_eq!(output_delta(Some(40), 0, "abc"), "abc");
    }

    #[test]
    fn delta_respects_char_boundaries() {
        assert_eq!(output_delta(Some(2), 0, "héllo"), "llo");
    }

    /// Trimming the front of the transcript must not re-record retained text.
    #[test]
    fn trimmed_transcript_records_each_chunk_once() {
        let mut manager = LogMessageManager::new();
        let mut transcript = String::new();
        let mut start = 0u64;
        for n in 0..50 {
            transcript.push_str(&format!("line {n:03} of plain output\n"));
            if transcript.len() > 100 {
                let cut = transcript.len() - 100;
                transcript.drain(..cut);
                start += cut as u64;
            }
            manager.observe(
                &Observation {
                    output_start: start,
                    ..observation(&transcript)
                },
                n,
            );
        }
        assert_eq!(manager.messages().len(), 50);
        assert_eq!(manager.messages()[49].text, "line 049 of plain output");
    }

    #[test]
    fn raw_delta_recorded_when_nothing_friendly() {
        let mut manager = LogMessageManager::new();
        manager.observe(&observation("booting shell\n"), 1);
        manager.observe(&observation("booting shell\nloading modules\n"), 2);
        assert_eq!(
            texts(&manager),
            vec![
                (MessageKind::Output, "booting shell"),
                (MessageKind::Output, "loading modules"),
            ]
        );
    }

    #[test]
    fn friendly_lines_are_extracted_and_errors_flagged() {
        let mut manager = LogMessageManager::new();
        manager.observe(
            &observation("noise\nStep 1: opening settings\nAction failed: no element\nmore noise\n"),
            1,
        );
        assert_eq!(
            texts(&manager),
            vec![
                (MessageKind::Output, "Step 1: opening settings"),
                (MessageKind::Error, "Action failed: no element"),
            ]
        );
    }

    #[test]
    fn credential_noise_is_dropped() {
        let mut manager = LogMessageManager::new();
        manager.observe(&observation("export GEMINI_API_KEY=abc\n"), 1);
        assert!(manager.messages().is_empty());
    }

    #[test]
    fn repeated_system_messages_are_deduplicated() {
        let mut manager = LogMessageManager::new();
        manager.push_system("Session ready".to_string(), 1);
        manager.push_system("Session ready".to_string(), 2);
        manager.push_error("boom".to_string(), 3);
        manager.push_system("Session ready".to_string(), 4);
        assert_eq!(manager.messages().len(), 3);
    }

    #[test]
    fn task_and_status_changes_are_logged_once() {
        let mut manager = LogMessageManager::new();
        let running = Observation {
            output: "",
            output_start: 0,
            status_line: "Running: open settings",
            task: Some("open settings"),
            task_status: TaskStatus::Running,
            running: true,
        };
        manager.observe(&observation(""), 0);
        manager.observe(&running, 1);
        assert_eq!(manager.observe(&running, 2), 0);
        assert_eq!(
            texts(&manager),
            vec![
                (MessageKind::User, "open settings"),
                (MessageKind::System, "Running: open settings"),
                (MessageKind::System, "Agent running"),
            ]
        );
        assert_eq!(manager.last_running(), Some(true));
    }

    #[test]
    fn reset_forgets_trackers_but_keeps_history() {
        let mut manager = LogMessageManager::new();
        manager.observe(&observation("first line\n"), 1);
        manager.reset();
        manager.observe(&observation("first line\n"), 2);
        assert_eq!(manager.messages().len(), 2);

        manager.clear();
        assert!(manager.messages().is_empty());
    }
}
