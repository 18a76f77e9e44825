//! Renders an ansible-style inventory file from a [`Playfile`]'s networks,
//! mirroring `goplay/books/ansible.go`.

use std::fmt::Write as _;

use crate::playfile::Playfile;

/// Renders one `[network-name]` section per network, one line per host.
pub fn render(playfile: &Playfile) -> Result<String, crate::error::PlayfileError> {
    let mut out = String::new();
    for (name, network) in &playfile.networks {
        writeln!(out, "[{name}]").ok();
        for host in network.resolve_hosts()? {
            let mut line = format!(
                "{} ansible_host={} ansible_port={}",
                host.host, host.host, host.port
            );
            write!(line, " ansible_user={}", host.user).ok();
            if let Some(identity) = &network.identity_file {
                write!(line, " ansible_ssh_private_key_file={identity}").ok();
            }
            writeln!(out, "{line}").ok();
        }
        writeln!(out).ok();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playfile::Network;
    use indexmap::IndexMap;

    #[test]
    fn renders_one_section_per_network() {
        let mut networks = IndexMap::new();
        networks.insert(
            "production".to_string(),
            Network {
                hosts: vec!["a".to_string()],
                ..Default::default()
            },
        );
        let playfile = Playfile {
            version: "1.0".to_string(),
            env: Default::default(),
            networks,
            commands: Default::default(),
            books: Default::default(),
        };
        let rendered = render(&playfile).unwrap();
        assert!(rendered.contains("[production]"));
        assert!(rendered.contains("ansible_host=a"));
    }
}
