use std::path::PathBuf;

use clap::Parser;
use play::orchestrator::Orchestrator;
use play::playfile::Playfile;
use play::{inventory, trust};
use regex::Regex;

#[derive(Debug, Parser)]
#[clap(name = "play", about = "Parallel remote-command executor")]
enum Cli {
    /// Run one or more books against a network.
    Run {
        #[clap(short, long, default_value = "Playfile.yml")]
        playfile: PathBuf,
        network: String,
        books: Vec<String>,
        #[clap(long, value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        #[clap(long)]
        debug: bool,
        #[clap(long)]
        only: Option<String>,
        #[clap(long)]
        except: Option<String>,
        /// Suppress the timestamp and host prompt on each output line.
        #[clap(long)]
        no_prefix: bool,
    },
    /// Key-pair generation and trust-setup, the SSH onboarding collaborator.
    Ssh {
        #[clap(subcommand)]
        action: SshAction,
    },
    /// Render an ansible inventory file from a Playfile.
    AnsibleInventory {
        #[clap(short, long, default_value = "Playfile.yml")]
        playfile: PathBuf,
        #[clap(short, long, default_value = "inventory.ini")]
        out: PathBuf,
    },
}

#[derive(Debug, Parser)]
enum SshAction {
    Keygen {
        #[clap(long, default_value = "play")]
        name: String,
        #[clap(long)]
        bits: Option<usize>,
        #[clap(long, default_value = ".")]
        dir: PathBuf,
    },
    TrustSetup {
        #[clap(long)]
        hosts: PathBuf,
        #[clap(long)]
        pubkey: PathBuf,
    },
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse() {
        Cli::Run {
            playfile,
            network,
            books,
            env,
            debug,
            only,
            except,
            no_prefix,
        } => run(playfile, network, books, env, debug, only, except, no_prefix)?,
        Cli::Ssh { action } => match action {
            SshAction::Keygen { name, bits, dir } => {
                let (private, public) = trust::keygen(&dir, &name, bits)?;
                println!("wrote {} and {}", private.display(), public.display());
            }
            SshAction::TrustSetup { hosts, pubkey } => {
                trust::trust_setup(&hosts, &pubkey)?;
                println!("trust setup complete");
            }
        },
        Cli::AnsibleInventory { playfile, out } => {
            let pf = Playfile::from_file(playfile)?;
            let rendered = inventory::render(&pf)?;
            std::fs::write(&out, rendered)?;
            println!("wrote {}", out.display());
        }
    }

    Ok(())
}

fn run(
    playfile_path: PathBuf,
    network_name: String,
    book_names: Vec<String>,
    cli_env: Vec<(String, String)>,
    debug: bool,
    only: Option<String>,
    except: Option<String>,
    no_prefix: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let playfile = Playfile::from_file(&playfile_path)?;
    let network = playfile.network(&network_name)?.clone();

    let mut env = playfile.env.clone();
    let mut sup_env = String::new();
    for (k, v) in &cli_env {
        env.set(k.clone(), v.clone());
        sup_env.push_str(&format!(" -e {k}=\"{v}\""));
    }
    if !sup_env.is_empty() {
        env.set("SUP_ENV", sup_env.trim().to_string());
    }

    let (only, except) = (only.as_deref(), except.as_deref());
    let network = filter_hosts(network, only, except);

    let mut commands = Vec::new();
    for book in &book_names {
        commands.extend(playfile.book_commands(book)?);
    }

    let orchestrator = Orchestrator {
        debug,
        no_prefix,
        ..Orchestrator::default()
    };
    orchestrator.run(&network, &env, &commands)?;
    Ok(())
}

/// Filters a network's declared host list through an allow/deny regex
/// pair. Applied before connecting; `hosts:` entries populated later via
/// `inventory` are filtered too, since `resolve_hosts` runs after this.
fn filter_hosts(
    mut network: play::playfile::Network,
    only: Option<&str>,
    except: Option<&str>,
) -> play::playfile::Network {
    if let Some(pattern) = only {
        if let Ok(re) = Regex::new(pattern) {
            network.hosts.retain(|h| re.is_match(h));
        }
    }
    if let Some(pattern) = except {
        if let Ok(re) = Regex::new(pattern) {
            network.hosts.retain(|h| !re.is_match(h));
        }
    }
    network
}
