//! A `Client` that runs books as a local `bash -c` subprocess.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use crate::book::Book;
use crate::error::ClientError;
use crate::host::HostAddress;

use super::{transition, Client, ClientState, ExitStatus, Signal};

/// Runs commands on the local machine instead of over SSH. `locally: true`
/// on a [`crate::playfile::Command`] substitutes one of these for the
/// network's usual clients.
pub struct LocalClient {
    env_prelude: String,
    state: ClientState,
    host: Option<HostAddress>,
    child: Option<Child>,
    last_error: Option<String>,
}

impl LocalClient {
    pub fn new(env_prelude: impl Into<String>) -> Self {
        Self {
            env_prelude: env_prelude.into(),
            state: ClientState::Disconnected,
            host: None,
            child: None,
            last_error: None,
        }
    }
}

impl Client for LocalClient {
    fn connect(&mut self, host: HostAddress) -> Result<(), ClientError> {
        transition(
            &mut self.state,
            ClientState::Disconnected,
            ClientState::Connected,
            ClientError::Connected,
        )?;
        self.host = Some(host);
        Ok(())
    }

    fn run(&mut self, book: &Book) -> Result<(), ClientError> {
        transition(
            &mut self.state,
            ClientState::Connected,
            ClientState::Running,
            ClientError::Running,
        )?;

        let script = format!("{}{}", self.env_prelude, book.run);
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match cmd.spawn() {
            Ok(child) => {
                self.child = Some(child);
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(ClientError::IO(e))
            }
        }
    }

    fn wait(&mut self) -> Result<ExitStatus, ClientError> {
        transition(
            &mut self.state,
            ClientState::Running,
            ClientState::Finished,
            ClientError::NotRunning,
        )?;
        let child = self.child.as_mut().ok_or(ClientError::NotRunning)?;
        let status = child.wait()?;
        Ok(ExitStatus {
            code: status.code().unwrap_or(-1),
        })
    }

    fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
        }
        self.state = ClientState::Disconnected;
        Ok(())
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.child
            .as_mut()
            .and_then(|c| c.stdin.take())
            .map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .as_mut()
            .and_then(|c| c.stdout.take())
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .as_mut()
            .and_then(|c| c.stderr.take())
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn signal(&mut self, signal: Signal) -> Result<(), ClientError> {
        match signal {
            Signal::Interrupt => {
                if let Some(child) = &self.child {
                    // SAFETY: libc::kill on a pid we own via Child.
                    unsafe {
                        libc_kill_interrupt(child.id());
                    }
                }
                Ok(())
            }
        }
    }

    fn prompt(&self) -> String {
        let user = self
            .host
            .as_ref()
            .map(|h| h.user.clone())
            .unwrap_or_else(whoami::username);
        format!("[{user}@localhost] >>> ")
    }

    fn host(&self) -> Option<&HostAddress> {
        self.host.as_ref()
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn state(&self) -> ClientState {
        self.state
    }
}

/// Sends `SIGINT` to a child process by pid. Kept as a tiny wrapper so the
/// unsafe FFI surface is a single named spot rather than inline in `signal`.
unsafe fn libc_kill_interrupt(pid: u32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    const SIGINT: i32 = 2;
    kill(pid as i32, SIGINT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Book as BookStruct;

    fn book(run: &str) -> BookStruct {
        BookStruct {
            clients: Vec::new(),
            run: run.to_string(),
            input: None,
            once: false,
            tty: false,
        }
    }

    #[test]
    fn runs_echo_and_reports_exit_code() {
        let mut client = LocalClient::new(String::new());
        client.connect(HostAddress {
            user: "tester".to_string(),
            passwd: None,
            host: "localhost".to_string(),
            port: 22,
        }).unwrap();
        client.run(&book("exit 0")).unwrap();
        let status = client.wait().unwrap();
        assert!(status.success());
    }

    #[test]
    fn run_before_connect_fails() {
        let mut client = LocalClient::new(String::new());
        assert!(matches!(client.run(&book("echo hi")), Err(ClientError::Running)));
    }

    #[test]
    fn prompt_uses_connected_user() {
        let mut client = LocalClient::new(String::new());
        client.connect(HostAddress {
            user: "deploy".to_string(),
            passwd: None,
            host: "localhost".to_string(),
            port: 22,
        }).unwrap();
        assert_eq!(client.prompt(), "[deploy@localhost] >>> ");
    }
}
