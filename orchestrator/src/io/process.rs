//! Child process helpers: bounded probes, streaming readers and terminal text cleanup.

use std::io::{ErrorKind, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// CSI, OSC and two-byte escape sequences.
static ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// `output_limit_bytes` bounds what is kept per stream; the rest is drained and discarded.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// Wait up to `timeout` for `child`, killing it if it is still alive.
///
/// Returns the exit status and whether the kill was needed.
pub fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    match child.wait_timeout(timeout).context("wait for child")? {
        Some(status) => Ok((status, false)),
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "child still running, killing");
            child.kill().context("kill child")?;
            let status = child.wait().context("wait child after kill")?;
            Ok((status, true))
        }
    }
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    Ok(buf)
}

/// Read `reader` until EOF, handing each decoded, cleaned chunk to `on_text`.
///
/// A pty master reports the child's exit as a read error rather than EOF, so
/// any error other than an interrupt ends the stream. Returns total bytes read.
pub fn pump_output<R: Read>(mut reader: R, mut on_text: impl FnMut(String)) -> u64 {
    let mut decoder = Utf8Decoder::default();
    let mut cleaner = TerminalCleaner::default();
    let mut chunk = [0u8; 4096];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(err = %err, "output stream closed");
                break;
            }
        };
        total += n as u64;
        let text = cleaner.push(&decoder.push(&chunk[..n]));
        if !text.is_empty() {
            on_text(text);
        }
    }

    let mut rest = cleaner.push(&decoder.finish());
    rest.push_str(&cleaner.finish());
    if !rest.is_empty() {
        on_text(rest);
    }
    total
}

/// Remove escape sequences and carriage returns so only printable text remains.
pub fn strip_terminal_controls(text: &str) -> String {
    let without_escapes = ESCAPE_RE.replace_all(text, "");
    without_escapes
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

/// Longest unfinished escape sequence held back before it is flushed as text.
const MAX_ESCAPE_CARRY: usize = 256;

/// Incremental [`strip_terminal_controls`] that holds back an escape sequence
/// split across read boundaries until its final byte arrives.
#[derive(Debug, Default)]
pub struct TerminalCleaner {
    pending: String,
}

impl TerminalCleaner {
    pub fn push(&mut self, text: &str) -> String {
        self.pending.push_str(text);
        let complete = match unfinished_escape(&self.pending) {
            Some(start) if self.pending.len() - start <= MAX_ESCAPE_CARRY => start,
            _ => self.pending.len(),
        };
        let tail = self.pending.split_off(complete);
        let cleaned = strip_terminal_controls(&self.pending);
        self.pending = tail;
        cleaned
    }

    /// Flush a sequence that never completed.
    pub fn finish(&mut self) -> String {
        let rest = strip_terminal_controls(&self.pending);
        self.pending.clear();
        rest
    }
}

/// Byte offset of a trailing escape sequence still missing its final byte.
fn unfinished_escape(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while let Some(found) = bytes[i..].iter().position(|b| *b == 0x1b) {
        let start = i + found;
        match escape_len(&bytes[start..]) {
            Some(len) => i = start + len,
            None => return Some(start),
        }
    }
    None
}

/// Length of the escape sequence at the start of `seq`, or `None` if it is cut off.
fn escape_len(seq: &[u8]) -> Option<usize> {
    match *seq.get(1)? {
        b'[' => {
            let mut j = 2;
            while seq.get(j).is_some_and(|b| (0x30..=0x3f).contains(b)) {
                j += 1;
            }
            while seq.get(j).is_some_and(|b| (0x20..=0x2f).contains(b)) {
                j += 1;
            }
            let last = seq.get(j)?;
            Some(if (0x40..=0x7e).contains(last) { j + 1 } else { j })
        }
        b']' => {
            let body = &seq[2..];
            let end = body.iter().position(|b| *b == 0x07 || *b == 0x1b)?;
            if body[end] == 0x07 {
                Some(end + 3)
            } else {
                body.get(end + 1)?;
                Some(end + 4)
            }
        }
        _ => Some(2),
    }
}

/// Incremental UTF-8 decoding across read boundaries.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much of the buffered input as forms complete characters.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    // valid_up_to() marks a char boundary, so this slice is valid UTF-8.
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever incomplete sequence remains.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
