//! Shell script composition for the hosted session.
//!
//! Everything written to the session is plain shell text terminated by a
//! newline. The agent's own command grammar is never parsed: the user's task
//! is passed through as a single quoted argument.

/// How the agent binary is invoked and which device bridge it talks to.
#[derive(Debug, Clone, Copy)]
pub struct AgentInvocation<'a> {
    pub binary: &'a str,
    pub subcommand: &'a str,
    /// Loopback device-bridge address, e.g. `127.0.0.1:5555`.
    pub bridge_address: &'a str,
    /// Tool used to (re)connect the device bridge, e.g. `adb`.
    pub bridge_tool: &'a str,
}

impl AgentInvocation<'_> {
    /// Text that appears in the echoed invocation line.
    pub fn marker(&self) -> String {
        format!("{} {}", self.binary, self.subcommand)
    }
}

/// Wrap `command` so the bridge is re-established before the agent runs.
///
/// Disconnect-then-connect is idempotent and tolerant of failure: a missing
/// device or an already-closed connection must not stop the agent from starting.
pub fn compose_task_script(invocation: &AgentInvocation<'_>, command: &str) -> String {
    let tool = invocation.bridge_tool;
    let address = invocation.bridge_address;
    format!(
        "{tool} disconnect {address} >/dev/null 2>&1 || true; \
         {tool} connect {address} >/dev/null 2>&1 || true; \
         {} {} {}",
        invocation.binary,
        invocation.subcommand,
        shell_quote(command)
    )
}

/// Commands issued once after a session opens.
pub fn setup_commands(invocation: &AgentInvocation<'_>, exports: &[(String, String)]) -> Vec<String> {
    let mut commands = Vec::with_capacity(exports.len() + 1);
    commands.push(format!(
        "{} connect {} >/dev/null 2>&1 || true",
        invocation.bridge_tool, invocation.bridge_address
    ));
    for (key, value) in exports {
        commands.push(format!("export {key}={}", shell_quote(value)));
    }
    commands
}

/// Whether `key` is usable as a shell variable name.
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Single-quote `value` for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
