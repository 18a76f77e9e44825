//! A `Client` backed by an SSH session via `ssh2` (libssh2 bindings).
//!
//! Host-key verification is intentionally disabled (a documented
//! non-goal). Authentication tries, in order: an explicit password, then a
//! process-wide, lazily-resolved set of public keys (the SSH agent plus
//! `~/.ssh/id_*`). Bastion tunneling is implemented by relaying a
//! `direct-tcpip` channel through a loopback `TcpListener`, since
//! `ssh2::Session::set_tcp_stream` requires a genuine `std::net::TcpStream`.

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use ssh2::Session;

use crate::book::Book;
use crate::error::ClientError;
use crate::host::HostAddress;

use super::{transition, Client, ClientState, ExitStatus, Signal};

/// Authentication material resolved once per process. `Debug` redacts
/// anything secret, matching how the teacher crate redacts `SSHConfig`.
struct SshAuth {
    keys: Vec<PathBuf>,
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshAuth")
            .field("keys", &self.keys.len())
            .field("agent", &"REDACTED")
            .finish()
    }
}

static AUTH: OnceCell<SshAuth> = OnceCell::new();

fn resolve_auth() -> &'static SshAuth {
    AUTH.get_or_init(|| {
        let mut keys = Vec::new();
        if let Some(home) = dirs_home() {
            let ssh_dir = home.join(".ssh");
            if let Ok(entries) = fs::read_dir(&ssh_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if name.starts_with("id_") && !name.ends_with(".pub") {
                        keys.push(path);
                    }
                }
            }
        }
        debug!("resolved {} local identity candidate(s)", keys.len());
        SshAuth { keys }
    })
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// A dial function, injectable so a bastion connection can provide the
/// transport for a nested session instead of a direct TCP dial.
pub type Dialer = Box<dyn Fn(&str) -> std::io::Result<TcpStream> + Send>;

fn direct_dial(addr: &str) -> std::io::Result<TcpStream> {
    TcpStream::connect(addr)
}

/// Builds a dialer that tunnels through `bastion`'s session via a
/// `direct-tcpip` channel, relayed to a local loopback socket so the
/// resulting `TcpStream` satisfies `ssh2::Session::set_tcp_stream`. The
/// bastion session is shared (not consumed) since every target host needs
/// its own tunnel over the same underlying connection.
pub fn bastion_dialer(bastion: Arc<Mutex<Session>>) -> Dialer {
    Box::new(move |addr: &str| {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad addr"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad port"))?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let local_addr = listener.local_addr()?;

        let channel = {
            let bastion = bastion.lock().unwrap_or_else(|p| p.into_inner());
            bastion.channel_direct_tcpip(host, port, None)?
        };
        std::thread::spawn(move || {
            if let Ok((accepted, _)) = listener.accept() {
                relay(accepted, channel);
            }
        });

        TcpStream::connect(local_addr)
    })
}

fn relay(mut local: TcpStream, mut channel: ssh2::Channel) {
    let mut to_remote = local.try_clone().expect("clone loopback stream");
    let handle = std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match to_remote.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if channel.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    let mut buf = [0u8; 8192];
    loop {
        match local.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if local.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    let _ = handle.join();
}

/// An SSH-backed [`Client`].
pub struct SshClient {
    env_prelude: String,
    dialer: Option<Dialer>,
    state: ClientState,
    host: Option<HostAddress>,
    session: Option<Arc<Mutex<Session>>>,
    channel: Option<Arc<Mutex<ssh2::Channel>>>,
    last_error: Option<String>,
    tty: bool,
}

impl SshClient {
    pub fn new(env_prelude: impl Into<String>) -> Self {
        Self {
            env_prelude: env_prelude.into(),
            dialer: None,
            state: ClientState::Disconnected,
            host: None,
            session: None,
            channel: None,
            last_error: None,
            tty: false,
        }
    }

    /// Connects through `bastion` instead of dialing directly.
    pub fn with_dialer(env_prelude: impl Into<String>, dialer: Dialer) -> Self {
        let mut client = Self::new(env_prelude);
        client.dialer = Some(dialer);
        client
    }

    /// A shared handle to this client's session, usable as a bastion for
    /// other clients' [`bastion_dialer`]. `None` until `connect` succeeds.
    pub fn session_handle(&self) -> Option<Arc<Mutex<Session>>> {
        self.session.clone()
    }

    fn authenticate(session: &Session, host: &HostAddress) -> Result<(), ClientError> {
        if let Some(passwd) = &host.passwd {
            session.userauth_password(&host.user, passwd)?;
            return Ok(());
        }

        if session.userauth_agent(&host.user).is_ok() {
            return Ok(());
        }

        let auth = resolve_auth();
        for key in &auth.keys {
            if session
                .userauth_pubkey_file(&host.user, None, key, None)
                .is_ok()
            {
                return Ok(());
            }
        }

        Err(ClientError::Connect {
            host: host.host.clone(),
            user: host.user.clone(),
            reason: "no usable authentication method".to_string(),
        })
    }
}

impl Client for SshClient {
    fn connect(&mut self, host: HostAddress) -> Result<(), ClientError> {
        transition(
            &mut self.state,
            ClientState::Disconnected,
            ClientState::Connected,
            ClientError::Connected,
        )?;

        let addr = host.addr();
        let tcp = match &self.dialer {
            Some(dial) => dial(&addr),
            None => direct_dial(&addr),
        }
        .map_err(|e| ClientError::Connect {
            host: host.host.clone(),
            user: host.user.clone(),
            reason: e.to_string(),
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        // Host-key verification is intentionally not performed (non-goal).

        Self::authenticate(&session, &host)?;

        self.session = Some(Arc::new(Mutex::new(session)));
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
        let session = self.session.as_ref().ok_or(ClientError::NotConnected)?;
        let mut session_guard = session.lock().unwrap_or_else(|p| p.into_inner());
        let mut channel = session_guard.channel_session()?;

        self.tty = book.tty;
        if book.tty {
            channel.request_pty("xterm", None, Some((80, 40, 0, 0)))?;
        }

        let script = format!("{}{}", self.env_prelude, book.run);
        channel.exec(&script)?;

        // Bounds a blocked read/write to a short window for the lifetime of
        // this book, so the stdout and stderr pumps release the channel's
        // lock between attempts instead of one starving the other; see
        // `SshChannelReader::read`. Reset to blocking before `wait`.
        session_guard.set_timeout(200);
        drop(session_guard);

        self.channel = Some(Arc::new(Mutex::new(channel)));
        Ok(())
    }

    fn wait(&mut self) -> Result<ExitStatus, ClientError> {
        transition(
            &mut self.state,
            ClientState::Running,
            ClientState::Finished,
            ClientError::NotRunning,
        )?;
        if let Some(session) = self.session.as_ref() {
            let mut session = session.lock().unwrap_or_else(|p| p.into_inner());
            session.set_timeout(0);
        }
        let channel = self.channel.as_ref().ok_or(ClientError::NotRunning)?;
        let mut channel = channel.lock().unwrap_or_else(|p| p.into_inner());
        channel.wait_close()?;
        let code = channel.exit_status()?;
        Ok(ExitStatus { code })
    }

    fn close(&mut self) -> Result<(), ClientError> {
        if let Some(channel) = self.channel.as_ref() {
            let mut channel = channel.lock().unwrap_or_else(|p| p.into_inner());
            let _ = channel.close();
        }
        self.channel = None;
        self.session = None;
        self.state = ClientState::Disconnected;
        Ok(())
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.channel
            .as_ref()
            .map(|c| Box::new(SshChannelWriter(c.clone())) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.channel
            .as_ref()
            .map(|c| Box::new(SshChannelReader::stdout(c.clone())) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.channel
            .as_ref()
            .map(|c| Box::new(SshChannelReader::stderr(c.clone())) as Box<dyn Read + Send>)
    }

    fn signal(&mut self, signal: Signal) -> Result<(), ClientError> {
        match signal {
            Signal::Interrupt => {
                if let Some(channel) = self.channel.as_ref() {
                    // The documented-effective path: write the literal
                    // interrupt byte. `ssh2` has no public API for a
                    // protocol-level `signal` channel request, unlike
                    // Go's `ssh.Session.Signal` (which many servers ignore
                    // anyway).
                    let mut channel = channel.lock().unwrap_or_else(|p| p.into_inner());
                    let _ = channel.write_all(b"\x03");
                }
                Ok(())
            }
        }
    }

    fn prompt(&self) -> String {
        let (user, host) = self
            .host
            .as_ref()
            .map(|h| (h.user.clone(), h.host.clone()))
            .unwrap_or_else(|| ("?".to_string(), "?".to_string()));
        format!("[{user}@{host}] - ")
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

/// `ssh2::Channel::stream` borrows the channel for its lifetime, which
/// doesn't fit a pump thread that needs to own its reader independently of
/// the client's own lock. These wrappers instead hold a shared handle to
/// the channel and lock it only for the duration of a single read/write
/// attempt: the session's read timeout (see `connect`) bounds a blocked
/// `read` to a short window, and the lock is dropped and re-acquired on
/// each retry so the stdout and stderr pumps take turns rather than one
/// starving the other while the remote is quiet on just one stream.
struct SshChannelReader {
    channel: Arc<Mutex<ssh2::Channel>>,
    stderr: bool,
}

impl SshChannelReader {
    fn stdout(channel: Arc<Mutex<ssh2::Channel>>) -> Self {
        Self { channel, stderr: false }
    }

    fn stderr(channel: Arc<Mutex<ssh2::Channel>>) -> Self {
        Self { channel, stderr: true }
    }
}

struct SshChannelWriter(Arc<Mutex<ssh2::Channel>>);

fn is_timeout(e: &std::io::Error) -> bool {
    e.to_string().to_lowercase().contains("timeout")
}

impl Read for SshChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let result = {
                let mut channel = self.channel.lock().unwrap_or_else(|p| p.into_inner());
                if self.stderr {
                    channel.stderr().read(buf)
                } else {
                    channel.read(buf)
                }
            };
            match result {
                Err(e) if is_timeout(&e) => continue,
                other => return other,
            }
        }
    }
}

impl Write for SshChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            let result = {
                let mut channel = self.0.lock().unwrap_or_else(|p| p.into_inner());
                channel.write(buf)
            };
            match result {
                Err(e) if is_timeout(&e) => continue,
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut channel = self.0.lock().unwrap_or_else(|p| p.into_inner());
        channel.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_keys_field() {
        let auth = SshAuth {
            keys: vec![PathBuf::from("/root/.ssh/id_rsa")],
        };
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("id_rsa"));
    }
}
