//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/input or other errors.
pub const INVALID: i32 = 1;
/// A mailbox read found no record (`bridge take-action`, `bridge take-result`, `bridge state`).
pub const NO_MESSAGE: i32 = 2;
/// The session host could not be reached.
pub const HOST_UNAVAILABLE: i32 = 3;
