//! Parallel remote-command execution driven by a declarative Playfile.
//!
//! A [`Playfile`](playfile::Playfile) describes networks of hosts, named
//! commands, and ordered lists of commands ("books"). [`Orchestrator::run`]
//! connects to every host in a network concurrently and streams a book's
//! commands to each of them, forwarding interrupts and reporting completion.
//!
//! ```no_run
//! use play::playfile::Playfile;
//! use play::orchestrator::Orchestrator;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let playfile = Playfile::from_file("Playfile.yml")?;
//! let network = playfile.networks.get("production").unwrap();
//! let commands = playfile.book_commands("deploy")?;
//! Orchestrator::default().run(network, &playfile.env, &commands)?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod book;
pub mod client;
pub mod env;
pub mod error;
pub mod host;
pub mod inventory;
pub mod orchestrator;
pub mod playfile;
pub mod trust;

pub use env::{EnvVar, EnvVars};
pub use error::{ClientError, PlayfileError, RunError};
pub use orchestrator::Orchestrator;
pub use playfile::{Command, Network, Playfile, Upload};
