//! Keypair generation and authorized-key installation, the out-of-core
//! collaborator that mirrors `goplay/books/ssh.go`'s `Init`/`Setup` flow.

use std::path::{Path, PathBuf};

use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::env::EnvVars;
use crate::error::{PlayfileError, RunError};
use crate::host::{self, is_valid_trust_setup_entry};
use crate::orchestrator::Orchestrator;
use crate::playfile::{Command, Network};

const DEFAULT_BITS: usize = 4096;

/// Generates an RSA keypair, writing `<name>_rsa` (private, `0600`) and
/// `<name>_rsa.pub` (public) under `dir`.
pub fn keygen(dir: &Path, name: &str, bits: Option<usize>) -> Result<(PathBuf, PathBuf), PlayfileError> {
    let bits = bits.unwrap_or(DEFAULT_BITS);
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| PlayfileError::BadAddress("keygen".to_string(), e.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let private_path = dir.join(format!("{name}_rsa"));
    let public_path = dir.join(format!("{name}_rsa.pub"));

    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| PlayfileError::BadAddress("keygen".to_string(), e.to_string()))?;
    std::fs::write(&private_path, private_pem.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let public_pem = public
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| PlayfileError::BadAddress("keygen".to_string(), e.to_string()))?;
    std::fs::write(&public_path, public_pem.as_bytes())?;

    Ok((private_path, public_path))
}

/// Parses a newline-delimited host-list file of `user:passwd@ipv4` entries,
/// collecting every invalid line into a single aggregated error rather than
/// failing on the first bad line.
pub fn parse_host_list(raw: &str) -> Result<Vec<String>, PlayfileError> {
    let mut hosts = Vec::new();
    let mut bad_lines = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_valid_trust_setup_entry(line) {
            hosts.push(line.to_string());
        } else {
            bad_lines.push(format!("{}: {line:?}", lineno + 1));
        }
    }
    if !bad_lines.is_empty() {
        return Err(PlayfileError::InvalidHostList(bad_lines.join(", ")));
    }
    Ok(hosts)
}

/// Appends `pubkey_path`'s contents to every host's `~/.ssh/authorized_keys`
/// using the same [`Orchestrator`] that runs regular books.
pub fn trust_setup(host_list_path: &Path, pubkey_path: &Path) -> Result<(), RunError> {
    let raw = std::fs::read_to_string(host_list_path).map_err(PlayfileError::IO)?;
    let hosts = parse_host_list(&raw).map_err(RunError::from)?;
    let pubkey = std::fs::read_to_string(pubkey_path).map_err(PlayfileError::IO)?;

    let network = Network {
        hosts,
        ..Default::default()
    };
    let mut env = EnvVars::new();
    env.set("PUB_KEY", pubkey.trim());
    let command = Command {
        run: Some("mkdir -p ~/.ssh && echo \"$PUB_KEY\" >> ~/.ssh/authorized_keys".to_string()),
        stdin: true,
        ..Default::default()
    };

    Orchestrator::default().run(&network, &env, &[&command])
}

/// Validates a single `user:passwd@ipv4` address string without touching
/// the filesystem, used by CLI argument validation.
pub fn validate_entry(entry: &str) -> bool {
    host::is_valid_trust_setup_entry(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_invalid_lines() {
        let raw = "a@1.2.3.4\nbad\na@1.2.3.256\n";
        match parse_host_list(raw) {
            Err(PlayfileError::InvalidHostList(msg)) => {
                assert!(msg.contains("bad"));
                assert!(msg.contains("1.2.3.256"));
            }
            other => panic!("expected InvalidHostList, got {other:?}"),
        }
    }

    #[test]
    fn accepts_all_valid_lines() {
        let raw = "a@1.2.3.4\nb@5.6.7.8\n";
        let hosts = parse_host_list(raw).unwrap();
        assert_eq!(hosts, vec!["a@1.2.3.4", "b@5.6.7.8"]);
    }
}
