//! The uniform contract over local shells and SSH sessions.
//!
//! Both concrete clients drive the same state machine:
//! `Disconnected -> Connected -> Running -> Finished`, and `close` is
//! idempotent from any state. Pipes are handed out once (`take_stdin` etc.),
//! mirroring [`std::process::Child`], so pump threads can own a stream
//! without holding any lock for the duration of a long-running copy.

pub mod local;
pub mod ssh;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use crate::error::ClientError;
use crate::host::HostAddress;

pub use local::LocalClient;
pub use ssh::SshClient;

/// A signal an interrupt trap can forward to a running client. Only
/// [`Signal::Interrupt`] is meaningfully supported; everything else is
/// rejected with [`ClientError::SignalNotSupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
}

/// Connection lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
    Running,
    Finished,
}

/// Enforces a single state transition, returning `err` if `state` isn't
/// currently `from`.
pub(crate) fn transition(
    state: &mut ClientState,
    from: ClientState,
    to: ClientState,
    err: ClientError,
) -> Result<(), ClientError> {
    if *state != from {
        return Err(err);
    }
    *state = to;
    Ok(())
}

/// Process exit status as reported by either a local child process or a
/// remote SSH session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A connection-bound driver of remote or local shell execution.
///
/// Implementors own at most one active session at a time; `run` fails
/// unless the client is `Connected`, and `wait` fails unless it is
/// `Running`.
pub trait Client: Send {
    fn connect(&mut self, host: HostAddress) -> Result<(), ClientError>;

    fn run(&mut self, book: &crate::book::Book) -> Result<(), ClientError>;

    fn wait(&mut self) -> Result<ExitStatus, ClientError>;

    fn close(&mut self) -> Result<(), ClientError>;

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>>;

    fn signal(&mut self, signal: Signal) -> Result<(), ClientError>;

    /// Display label used to prefix output lines, e.g. `[user@host] > `.
    fn prompt(&self) -> String;

    fn host(&self) -> Option<&HostAddress>;

    /// Description of the last state-changing operation's failure, if any.
    /// A `String` rather than `&ClientError` since the underlying error
    /// types (`io::Error`, `ssh2::Error`) aren't `Clone`.
    fn last_error(&self) -> Option<&str>;

    fn state(&self) -> ClientState;
}

/// A `Client` shared between the orchestrator and its pump threads.
#[derive(Clone)]
pub struct SharedClient(Arc<Mutex<Box<dyn Client>>>);

impl SharedClient {
    pub fn new(client: Box<dyn Client>) -> Self {
        Self(Arc::new(Mutex::new(client)))
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn Client>> {
        self.0.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Whether `self` and `other` refer to the same underlying client.
    pub fn ptr_eq(&self, other: &SharedClient) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Right-aligns `s` to `width` by prepending spaces, for aligned prompts.
pub fn pad(s: &str, width: usize) -> String {
    if s.len() >= width {
        s.to_string()
    } else {
        format!("{}{s}", " ".repeat(width - s.len()))
    }
}

/// `"2006/01/02 15:04:05 - "` style timestamp prefix, matching the original
/// tool's log line format, followed by the right-aligned prompt.
pub fn pad_with_timestamp(now: &str, s: &str, width: usize) -> String {
    format!("{now} - {}", pad(s, width))
}

#[cfg(test)]
pub(crate) struct NullClient {
    state: ClientState,
}

#[cfg(test)]
impl Client for NullClient {
    fn connect(&mut self, _host: HostAddress) -> Result<(), ClientError> {
        self.state = ClientState::Connected;
        Ok(())
    }

    fn run(&mut self, _book: &crate::book::Book) -> Result<(), ClientError> {
        self.state = ClientState::Running;
        Ok(())
    }

    fn wait(&mut self) -> Result<ExitStatus, ClientError> {
        self.state = ClientState::Finished;
        Ok(ExitStatus { code: 0 })
    }

    fn close(&mut self) -> Result<(), ClientError> {
        self.state = ClientState::Disconnected;
        Ok(())
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        None
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        None
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        None
    }

    fn signal(&mut self, _signal: Signal) -> Result<(), ClientError> {
        Ok(())
    }

    fn prompt(&self) -> String {
        "[test] > ".to_string()
    }

    fn host(&self) -> Option<&HostAddress> {
        None
    }

    fn last_error(&self) -> Option<&str> {
        None
    }

    fn state(&self) -> ClientState {
        self.state
    }
}

#[cfg(test)]
impl SharedClient {
    /// A no-op client used by unit tests that only care about fan-out
    /// assignment, not actual execution.
    pub fn test_double() -> Self {
        Self::new(Box::new(NullClient {
            state: ClientState::Connected,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_right_aligns() {
        assert_eq!(pad("a", 4), "   a");
        assert_eq!(pad("abcd", 2), "abcd");
    }

    #[test]
    fn pad_with_timestamp_prefixes_the_padded_prompt() {
        assert_eq!(
            pad_with_timestamp("2026/07/27 10:00:00", "a", 4),
            "2026/07/27 10:00:00 -    a"
        );
    }
}
