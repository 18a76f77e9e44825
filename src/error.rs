//! Error kinds for the Playfile loader, the clients and the orchestrator.
//!
//! Each concern gets its own enum, mirroring how [`crate::playfile`] and
//! [`crate::client`] are independent layers: a playfile can be malformed
//! without ever touching a client, and a client can misbehave without the
//! playfile being at fault.

use thiserror::Error;

/// Errors raised while loading or interpreting a [`crate::playfile::Playfile`].
#[derive(Debug, Error)]
pub enum PlayfileError {
    #[error("Input-Output error: {0}")]
    IO(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported playfile version {0:?}, run the upgrade tool and retry")]
    Version(String),

    #[error("book {0:?} is not defined")]
    UnknownBook(String),

    #[error("command {0:?} is not defined")]
    UnknownCommand(String),

    #[error("network {0:?} is not defined")]
    UnknownNetwork(String),

    #[error("failed to resolve environment variable {0:?}: {1}")]
    EnvResolve(String, String),

    #[error("invalid host entry at line {0}: {1:?}")]
    InvalidHost(usize, String),

    #[error("invalid host-list entries: {0}")]
    InvalidHostList(String),

    #[error("host address {0:?} is malformed: {1}")]
    BadAddress(String, String),
}

/// Errors raised by the [`crate::client::Client`] state machine and its
/// concrete implementations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is already connected")]
    Connected,

    #[error("client is not connected")]
    NotConnected,

    #[error("client is already running a command")]
    Running,

    #[error("client is not running a command")]
    NotRunning,

    #[error("client session is already opened")]
    Opened,

    #[error("client session is not opened")]
    NotOpened,

    #[error("signal {0:?} is not supported by this client")]
    SignalNotSupported(String),

    #[error("failed to connect to {user}@{host}: {reason}")]
    Connect {
        host: String,
        user: String,
        reason: String,
    },

    #[error("input-output error: {0}")]
    IO(#[from] std::io::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
}

/// Errors raised by [`crate::orchestrator::Orchestrator::run`] itself, as
/// opposed to per-client failures (which are absorbed and logged, see
/// `SPEC_FULL.md` section 7).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no commands were given to run")]
    EmptyCommand,

    #[error("no client could be connected")]
    EmptyClient,

    #[error("failed to connect to the bastion host: {0}")]
    Bastion(#[source] ClientError),

    #[error(transparent)]
    Playfile(#[from] PlayfileError),
}
