//! Task execution orchestrator for a shell-hosted automation agent.
//!
//! The orchestrator runs the agent inside one interactive shell session,
//! infers task progress from the session's output, tracks the task lifecycle,
//! and serves the agent's file mailbox. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, lifecycle
//!   transitions, log messages, script composition). No I/O.
//! - **[`io`]**: Side-effecting operations (config, session host, bridge
//!   mailbox, status store). Isolated behind traits so tests can script them.
//!
//! [`session`] and [`orchestrator`] coordinate the two: the orchestrator is a
//! single-owner event loop through which every state change flows.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
