//! Deterministic classification of agent output into lifecycle signals.
//!
//! The agent binary reports progress only as free text, so completion is
//! inferred from phrases it is known to print and from the shell prompt
//! returning after it exits. The phrase lists are a versioned contract with
//! that binary: when its wording changes, classification accuracy degrades
//! and the contract must be bumped, not patched around.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{Signal, TaskDescriptor};

/// Number of trailing lines inspected for a returned shell prompt.
const PROMPT_TAIL_LINES: usize = 3;

/// Default grace window after task start during which prompt returns are ignored.
pub const DEFAULT_GRACE_MS: u64 = 2_000;

/// A line ending in `$`, `>` or `#` with optional trailing whitespace.
static PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[$>#]\s*$").unwrap());

/// Phrases the agent binary prints on completion/failure, plus the marker that
/// appears in our own invocation line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhraseContract {
    /// Bumped whenever the phrase lists change.
    pub version: u32,
    pub completion: Vec<String>,
    pub failure: Vec<String>,
    pub invocation_marker: String,
}

impl Default for PhraseContract {
    fn default() -> Self {
        Self {
            version: 1,
            completion: vec![
                "goal achieved".to_string(),
                "task completed".to_string(),
                "code execution successful".to_string(),
            ],
            failure: vec!["goal failed".to_string(), "task failed".to_string()],
            invocation_marker: "droidrun run".to_string(),
        }
    }
}

impl PhraseContract {
    pub fn validate(&self) -> Result<(), String> {
        if self.completion.iter().any(|p| p.trim().is_empty())
            || self.failure.iter().any(|p| p.trim().is_empty())
        {
            return Err("classifier phrases must be non-empty".to_string());
        }
        if self.invocation_marker.trim().is_empty() {
            return Err("classifier.invocation_marker must be non-empty".to_string());
        }
        Ok(())
    }
}

/// Maps accumulated output to a [`Signal`]. Holds no per-call state.
#[derive(Debug, Clone)]
pub struct TaskProgressClassifier {
    completion: Vec<String>,
    failure: Vec<String>,
    marker: String,
    grace_ms: u64,
}

impl TaskProgressClassifier {
    pub fn new(contract: &PhraseContract, grace_ms: u64) -> Self {
        Self {
            completion: lowercase_all(&contract.completion),
            failure: lowercase_all(&contract.failure),
            marker: contract.invocation_marker.to_lowercase(),
            grace_ms,
        }
    }

    pub fn grace_ms(&self) -> u64 {
        self.grace_ms
    }

    /// Classify `text` (output accumulated since `task` started).
    ///
    /// The first line carrying the invocation marker is the session echoing
    /// our own script; it is not matched against the phrase lists, so a task
    /// whose text contains "task failed" does not fail itself. Later marker
    /// lines are agent output and match normally.
    pub fn classify(&self, text: &str, task: Option<&TaskDescriptor>, elapsed_ms: u64) -> Signal {
        if task.is_none() {
            return Signal::NoChange;
        }

        let lowered = text.to_lowercase();
        let mut agent_lines: Vec<&str> = lowered.lines().collect();
        if let Some(echo) = agent_lines.iter().position(|line| line.contains(&self.marker)) {
            agent_lines.remove(echo);
        }

        if contains_any(&agent_lines, &self.completion) {
            return Signal::Completed;
        }
        if contains_any(&agent_lines, &self.failure) {
            return Signal::Failed;
        }

        if elapsed_ms > self.grace_ms && self.prompt_returned(&lowered) {
            return Signal::Completed;
        }

        Signal::StillRunning
    }

    fn prompt_returned(&self, lowered: &str) -> bool {
        let lines: Vec<&str> = lowered.lines().collect();
        let start = lines.len().saturating_sub(PROMPT_TAIL_LINES);
        let tail = &lines[start..];

        if tail.iter().any(|line| line.contains(&self.marker)) {
            return false;
        }

        tail.iter()
            .rev()
            .find(|line| !line.trim().is_empty())
            .is_some_and(|line| PROMPT_RE.is_match(line))
    }
}

fn lowercase_all(phrases: &[String]) -> Vec<String> {
    phrases.iter().map(|p| p.to_lowercase()).collect()
}

fn contains_any(lines: &[&str], phrases: &[String]) -> bool {
    lines
        .iter()
        .any(|line| phrases.iter().any(|phrase| line.contains(phrase.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> TaskProgressClassifier {
        TaskProgressClassifier::new(&PhraseContract::default(), DEFAULT_GRACE_MS)
    }

    fn task() -> TaskDescriptor {
        TaskDescriptor::new("open settings", 0)
    }

    #[test]
    fn no_task_is_no_change() {
        let signal = classifier().classify("Goal achieved\n$ ", None, 10_000);
        assert_eq!(signal, Signal::NoChange);
    }

    #[test]
    fn completion_phrase_is_case_insensitive() {
        let signal = classifier().classify("step 3\nGOAL ACHIEVED!\n", Some(&task()), 100);
        assert_eq!(signal, Signal::Completed);
    }

    #[test]
    fn failure_phrase_fails() {
        let signal = classifier().classify("thinking\nTask failed: no app\n", Some(&task()), 100);
        assert_eq!(signal, Signal::Failed);
    }

    #[test]
    fn completion_wins_over_failure() {
        let text = "retrying after goal failed\ngoal achieved\n";
        assert_eq!(
            classifier().classify(text, Some(&task()), 100),
            Signal::Completed
        );
    }

    #[test]
    fn prompt_inside_grace_window_keeps_running() {
        let signal = classifier().classify("working...\n$ ", Some(&task()), 500);
        assert_eq!(signal, Signal::StillRunning);
    }

    #[test]
    fn prompt_after_grace_window_completes() {
        let signal = classifier().classify("working...\n$ ", Some(&task()), 3_000);
        assert_eq!(signal, Signal::Completed);
    }

    #[test]
    fn prompt_exactly_at_grace_boundary_keeps_running() {
        let signal = classifier().classify("working...\n# ", Some(&task()), DEFAULT_GRACE_MS);
        assert_eq!(signal, Signal::StillRunning);
    }

    #[test]
    fn marker_in_tail_suppresses_prompt_completion() {
        let text = "~ $ droidrun run 'open settings'\n>";
        assert_eq!(
            classifier().classify(text, Some(&task()), 5_000),
            Signal::StillRunning
        );
    }

    #[test]
    fn echoed_command_does_not_match_phrases() {
        let text = "~ $ droidrun run 'check task completed banner'\nstep 1\n";
        assert_eq!(
            classifier().classify(text, Some(&task()), 100),
            Signal::StillRunning
        );
    }

    #[test]
    fn later_marker_lines_are_agent_output() {
        let text = "~ $ droidrun run 'open settings'\nstep 1\ndroidrun run finished: goal achieved\n";
        assert_eq!(
            classifier().classify(text, Some(&task()), 100),
            Signal::Completed
        );
    }

    #[test]
    fn prompt_must_be_last_non_blank_line() {
        let text = "a > b\nstill working\n\n";
        assert_eq!(
            classifier().classify(text, Some(&task()), 5_000),
            Signal::StillRunning
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let c = classifier();
        let inputs = [
            ("", 0),
            ("line\n$ ", 1_500),
            ("line\n$ ", 2_500),
            ("Task failed", 10),
            ("droidrun run x\n$", 9_000),
        ];
        for (text, elapsed) in inputs {
            let first = c.classify(text, Some(&task()), elapsed);
            for _ in 0..3 {
                assert_eq!(c.classify(text, Some(&task()), elapsed), first);
            }
        }
    }

    #[test]
    fn custom_contract_replaces_phrases() {
        let contract = PhraseContract {
            version: 2,
            completion: vec!["All Done".to_string()],
            failure: vec!["boom".to_string()],
            invocation_marker: "agent exec".to_string(),
        };
        let c = TaskProgressClassifier::new(&contract, 1_000);
        assert_eq!(c.classify("all done", Some(&task()), 0), Signal::Completed);
        assert_eq!(c.classify("goal achieved", Some(&task()), 0), Signal::StillRunning);
        assert_eq!(c.classify("BOOM", Some(&task()), 0), Signal::Failed);
    }

    #[test]
    fn contract_rejects_blank_marker() {
        let contract = PhraseContract {
            invocation_marker: " ".to_string(),
            ..PhraseContract::default()
        };
        assert!(contract.validate().is_err());
    }
}
