//! The declarative configuration format: networks, commands and books.
//!
//! Iteration order over [`Playfile::networks`], [`Playfile::commands`] and
//! [`Playfile::books`] follows the order keys appeared in the source YAML,
//! via [`IndexMap`].

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::env::EnvVars;
use crate::error::PlayfileError;
use crate::host::{self, HostAddress};

fn default_version() -> String {
    "1.0".to_string()
}

fn default_port() -> u16 {
    22
}

/// A single upload step: copy `src` (on the machine running the book) to
/// `dst` on every assigned client, skipping paths matched by `filter`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Upload {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub filter: Vec<String>,
}

/// A named shell action: some combination of uploads, a script file, and an
/// inline run string, plus the policy for which clients run it.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Command {
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default, alias = "upload")]
    pub uploads: IndexMap<String, Upload>,
    #[serde(default)]
    pub serial: usize,
    #[serde(default)]
    pub locally: bool,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub once: bool,
}

/// A named group of hosts with shared authentication defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Network {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub env: EnvVars,
    #[serde(default)]
    pub inventory: Option<String>,
    #[serde(default)]
    pub bastion: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub passwd: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<String>,
}

impl Network {
    /// Resolves every host string (plus whatever `inventory` emits) into a
    /// [`HostAddress`], layering this network's `user`/`passwd`/`port`
    /// defaults over any field the host string itself left unspecified.
    pub fn resolve_hosts(&self) -> Result<Vec<HostAddress>, PlayfileError> {
        let mut raw = self.hosts.clone();
        if let Some(inventory) = &self.inventory {
            raw.extend(run_inventory(inventory)?);
        }

        raw.into_iter()
            .map(|h| {
                let parts = host::parse_parts(&h)?;
                Ok(HostAddress {
                    user: parts
                        .user
                        .or_else(|| self.user.clone())
                        .unwrap_or_else(whoami::username),
                    passwd: parts.passwd.or_else(|| self.passwd.clone()),
                    host: parts.host,
                    port: parts.port.unwrap_or(self.port),
                })
            })
            .collect()
    }

    /// Resolved bastion host address, if a bastion is configured.
    pub fn bastion_address(&self) -> Option<Result<HostAddress, PlayfileError>> {
        self.bastion.as_ref().map(|b| host::parse(b))
    }
}

fn run_inventory(command: &str) -> Result<Vec<String>, PlayfileError> {
    let output = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// The top-level declarative configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Playfile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub env: EnvVars,
    #[serde(default)]
    pub networks: IndexMap<String, Network>,
    #[serde(default)]
    pub commands: IndexMap<String, Command>,
    #[serde(default, alias = "targets")]
    pub books: IndexMap<String, Vec<String>>,
}

impl Playfile {
    /// Parses YAML text into a [`Playfile`], normalizing tabs to two spaces
    /// first (hand-edited files commonly mix the two) and validating the
    /// version field.
    pub fn parse(raw: &str) -> Result<Self, PlayfileError> {
        let normalized = raw.replace('\t', "  ");
        let playfile: Playfile = serde_yaml::from_str(&normalized)?;
        if playfile.version != "1.0" {
            return Err(PlayfileError::Version(playfile.version));
        }
        Ok(playfile)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PlayfileError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn network(&self, name: &str) -> Result<&Network, PlayfileError> {
        self.networks
            .get(name)
            .ok_or_else(|| PlayfileError::UnknownNetwork(name.to_string()))
    }

    /// Resolves a book name into the ordered list of [`Command`]s it names.
    pub fn book_commands(&self, book: &str) -> Result<Vec<&Command>, PlayfileError> {
        let names = self
            .books
            .get(book)
            .ok_or_else(|| PlayfileError::UnknownBook(book.to_string()))?;
        names
            .iter()
            .map(|name| {
                self.commands
                    .get(name)
                    .ok_or_else(|| PlayfileError::UnknownCommand(name.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
env:
  - key: GLOBAL
    value: "1"
networks:
  production:
    hosts: ["a", "b"]
  staging:
    hosts: ["c"]
commands:
  deploy:
    run: "echo deploying"
  restart:
    run: "echo restarting"
books:
  release: ["deploy", "restart"]
"#;

    #[test]
    fn parses_sample_and_preserves_order() {
        let pf = Playfile::parse(SAMPLE).unwrap();
        assert_eq!(
            pf.networks.keys().cloned().collect::<Vec<_>>(),
            vec!["production", "staging"]
        );
        assert_eq!(
            pf.commands.keys().cloned().collect::<Vec<_>>(),
            vec!["deploy", "restart"]
        );
        let commands = pf.book_commands("release").unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].run.as_deref(), Some("echo deploying"));
    }

    #[test]
    fn legacy_targets_key_is_accepted() {
        let yaml = SAMPLE.replace("books:", "targets:");
        let pf = Playfile::parse(&yaml).unwrap();
        assert!(pf.books.contains_key("release"));
    }

    #[test]
    fn rejects_unknown_version() {
        let yaml = SAMPLE.replace("1.0", "2.0");
        match Playfile::parse(&yaml) {
            Err(PlayfileError::Version(v)) => assert_eq!(v, "2.0"),
            other => panic!("expected Version error, got {other:?}"),
        }
    }

    #[test]
    fn tabs_are_normalized() {
        let yaml = "version: \"1.0\"\nnetworks:\n\tproduction:\n\t\thosts: [\"a\"]\n";
        let pf = Playfile::parse(yaml).unwrap();
        assert_eq!(pf.networks["production"].hosts, vec!["a"]);
    }

    #[test]
    fn network_resolves_host_defaults() {
        let mut net = Network {
            hosts: vec!["h".to_string(), "other@h2".to_string()],
            user: Some("deploy".to_string()),
            port: 2222,
            ..Default::default()
        };
        net.inventory = None;
        let addrs = net.resolve_hosts().unwrap();
        assert_eq!(addrs[0].user, "deploy");
        assert_eq!(addrs[0].port, 2222);
        assert_eq!(addrs[1].user, "other");
    }
}
