//! I/O helpers for orchestrator commands.

pub mod bridge;
pub mod bridge_worker;
pub mod config;
pub mod host;
pub mod init;
pub mod process;
pub mod status_store;
