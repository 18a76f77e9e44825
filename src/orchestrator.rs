//! Connects every host in a network, then runs each book of each command
//! against the survivors, streaming output and forwarding interrupts.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use signal_hook::consts::SIGINT;
use signal_hook::iterator::Signals;

use crate::book::{self, Book, Input};
use crate::client::{ssh::bastion_dialer, Client, LocalClient, SharedClient, Signal as ClientSignal, SshClient};
use crate::env::EnvVars;
use crate::error::RunError;
use crate::host::HostAddress;
use crate::playfile::{Command, Network};

/// Output suppressed as a "normal" shutdown rather than a failure. `15` is
/// `SIGTERM`'s exit status convention inherited from the original tool;
/// toggled by [`Orchestrator::suppress_sigterm`] rather than hardcoded
/// (see `DESIGN.md`, Open Question b).
const SIGTERM_EXIT_STATUS: i32 = 15;

/// Runs books of commands against a network's clients, in sequence.
pub struct Orchestrator {
    /// Prefix every run with `set -x;` for shell tracing.
    pub debug: bool,
    /// Whether an SSH exit status of 15 (SIGTERM) is logged as success.
    pub suppress_sigterm: bool,
    /// Suppress the `timestamp - prompt` prefix on piped output lines.
    pub no_prefix: bool,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self {
            debug: false,
            suppress_sigterm: true,
            no_prefix: false,
        }
    }
}

/// A connected client plus bookkeeping the orchestrator needs to align
/// output and decide whether it's still worth using.
struct Survivor {
    client: SharedClient,
    prompt: String,
}

impl Orchestrator {
    /// Connects to `network` and runs every book of every command in
    /// `commands`, in order.
    pub fn run(
        &self,
        network: &Network,
        envs: &EnvVars,
        commands: &[&Command],
    ) -> Result<(), RunError> {
        if commands.is_empty() {
            return Err(RunError::EmptyCommand);
        }

        let bastion_session = match network.bastion_address() {
            Some(addr) => {
                let addr = addr?;
                let mut bastion = SshClient::new(String::new());
                bastion.connect(addr).map_err(RunError::Bastion)?;
                Some(bastion.session_handle().expect("just connected"))
            }
            None => None,
        };

        let mut prelude = envs.clone();
        prelude.extend(&network.env);

        let hosts = network.resolve_hosts()?;
        let survivors = self.connect_all(&hosts, &prelude, bastion_session)?;
        if survivors.is_empty() {
            return Err(RunError::EmptyClient);
        }

        let max_prompt_len = survivors.iter().map(|s| s.prompt.len()).max().unwrap_or(0);
        let cwd = std::env::current_dir().unwrap_or_default();
        let clients: Vec<SharedClient> = survivors.iter().map(|s| s.client.clone()).collect();

        for command in commands {
            let mut books = book::build(command, &clients, self.debug, &cwd, &prelude.as_export())?;
            for b in &mut books {
                let mut batches = book::serial_batches(b, command.serial);
                if batches.is_empty() {
                    self.run_book(b, max_prompt_len)?;
                } else {
                    for batch in &mut batches {
                        self.run_book(batch, max_prompt_len)?;
                    }
                }
            }
            close_ad_hoc_clients(&books, &clients);
        }

        for survivor in &survivors {
            let _ = survivor.client.lock().close();
        }

        Ok(())
    }

    fn connect_all(
        &self,
        hosts: &[HostAddress],
        prelude: &EnvVars,
        bastion: Option<Arc<Mutex<ssh2::Session>>>,
    ) -> Result<Vec<Survivor>, RunError> {
        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();

        for host in hosts.iter().cloned() {
            let tx = tx.clone();
            let mut host_prelude = prelude.clone();
            host_prelude.set("PLAY_HOST", host.masked());
            let bastion = bastion.clone();

            let handle = std::thread::Builder::new()
                .name(format!("connect-{}", host.host))
                .spawn(move || {
                    let is_local = host.host == "localhost" || host.host == "127.0.0.1";
                    let export = host_prelude.as_export();
                    let mut client: Box<dyn Client> = if is_local {
                        Box::new(LocalClient::new(export))
                    } else if let Some(bastion) = bastion {
                        Box::new(SshClient::with_dialer(export, bastion_dialer(bastion)))
                    } else {
                        Box::new(SshClient::new(export))
                    };
                    let result = client.connect(host.clone());
                    let _ = tx.send((client, result, host));
                })
                .expect("spawn connect worker");
            handles.push(handle);
        }
        drop(tx);

        for handle in handles {
            let _ = handle.join();
        }

        let mut survivors = Vec::new();
        while let Ok((client, result, host)) = rx.try_recv() {
            match result {
                Ok(()) => {
                    let prompt = client.prompt();
                    survivors.push(Survivor {
                        client: SharedClient::new(client),
                        prompt,
                    });
                }
                Err(e) => {
                    warn!("failed to connect to {}: {e}", host.masked());
                }
            }
        }

        Ok(survivors)
    }

    fn run_book(&self, b: &mut Book, max_prompt_len: usize) -> Result<(), RunError> {
        let running: Vec<(SharedClient, String)> = b
            .clients
            .iter()
            .map(|c| (c.clone(), pad_prompt(&c.lock().prompt(), max_prompt_len)))
            .collect();

        let mut started: Vec<(SharedClient, String)> = Vec::new();
        for (client, prompt) in &running {
            match client.lock().run(b) {
                Ok(()) => started.push((client.clone(), prompt.clone())),
                Err(e) => warn!("{prompt}failed to start: {e}"),
            }
        }

        let stdout_lock = Arc::new(Mutex::new(()));
        let mut pump_handles = Vec::new();
        for (client, prompt) in &started {
            if let Some(reader) = client.lock().take_stdout() {
                let lock = stdout_lock.clone();
                let prompt = prompt.clone();
                let no_prefix = self.no_prefix;
                pump_handles.push(std::thread::spawn(move || {
                    pump(reader, std::io::stdout(), lock, &prompt, no_prefix)
                }));
            }
            if let Some(reader) = client.lock().take_stderr() {
                let lock = stdout_lock.clone();
                let prompt = prompt.clone();
                let no_prefix = self.no_prefix;
                pump_handles.push(std::thread::spawn(move || {
                    pump(reader, std::io::stderr(), lock, &prompt, no_prefix)
                }));
            }
        }

        let stdin_handle = match b.input.take() {
            Some(Input::ProcessStdin) => {
                let writers: Vec<Box<dyn Write + Send>> = started
                    .iter()
                    .filter_map(|(c, _)| c.lock().take_stdin())
                    .collect();
                Some(std::thread::spawn(move || {
                    fan_out_stdin(std::io::stdin(), writers)
                }))
            }
            Some(Input::Tar(mut reader)) => {
                // One-shot upload payload: written directly, no live fan-out.
                let mut buf = Vec::new();
                let _ = reader.read_to_end(&mut buf);
                for (client, _) in &started {
                    if let Some(mut writer) = client.lock().take_stdin() {
                        let _ = writer.write_all(&buf);
                    }
                }
                None
            }
            None => None,
        };

        let trap_clients: Vec<SharedClient> = started.iter().map(|(c, _)| c.clone()).collect();
        let dispatcher = Signals::new([SIGINT]).ok().map(|mut signals| {
            let handle = signals.handle();
            let thread = std::thread::spawn(move || {
                for _ in signals.forever() {
                    for client in &trap_clients {
                        let _ = client.lock().signal(ClientSignal::Interrupt);
                    }
                }
            });
            (handle, thread)
        });

        for handle in pump_handles {
            let _ = handle.join();
        }
        if let Some(handle) = stdin_handle {
            let _ = handle.join();
        }

        for (client, prompt) in &started {
            let result = client.lock().wait();
            match result {
                Ok(status) if status.success() => info!("{prompt}Done!"),
                Ok(status) if self.suppress_sigterm && status.code == SIGTERM_EXIT_STATUS => {
                    info!("{prompt}Done! (terminated)")
                }
                Ok(status) => warn!("{prompt}exited with status {}", status.code),
                Err(e) => warn!("{prompt}{e}"),
            }
        }

        // Uninstall the trap before the next book so traps never leak
        // across books (SPEC_FULL.md section 9).
        if let Some((handle, thread)) = dispatcher {
            handle.close();
            let _ = thread.join();
        }

        Ok(())
    }
}

fn pad_prompt(prompt: &str, width: usize) -> String {
    crate::client::pad(prompt, width)
}

/// Closes every client referenced by `books` that isn't one of the network's
/// own `survivors` — i.e. the ad-hoc [`LocalClient`] a `command.locally`
/// substitutes in, which `Orchestrator::run`'s final survivor-closing loop
/// never sees. A command's script and run books share one such client, so
/// each is closed at most once.
fn close_ad_hoc_clients(books: &[Book], survivors: &[SharedClient]) {
    let mut closed: Vec<SharedClient> = Vec::new();
    for book in books {
        for client in &book.clients {
            let is_survivor = survivors.iter().any(|s| s.ptr_eq(client));
            let already_closed = closed.iter().any(|c| c.ptr_eq(client));
            if !is_survivor && !already_closed {
                let _ = client.lock().close();
                closed.push(client.clone());
            }
        }
    }
}

fn pump<R: Read, W: Write>(
    mut reader: R,
    mut sink: W,
    lock: Arc<Mutex<()>>,
    prompt: &str,
    no_prefix: bool,
) {
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                line.extend_from_slice(&buf[..n]);
                while let Some(pos) = line.iter().position(|&b| b == b'\n') {
                    let rest = line.split_off(pos + 1);
                    let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
                    if !no_prefix {
                        let _ = sink.write_all(prefixed(prompt).as_bytes());
                    }
                    let _ = sink.write_all(&line);
                    line = rest;
                }
            }
        }
    }
    if !line.is_empty() {
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
        if !no_prefix {
            let _ = sink.write_all(prefixed(prompt).as_bytes());
        }
        let _ = sink.write_all(&line);
        let _ = sink.write_all(b"\n");
    }
}

/// `"2006/01/02 15:04:05 - "` timestamp followed by the already-aligned
/// `prompt`, for a single output line.
fn prefixed(prompt: &str) -> String {
    let now = chrono::Local::now().format("%Y/%m/%d %H:%M:%S").to_string();
    crate::client::pad_with_timestamp(&now, prompt, prompt.len())
}

fn fan_out_stdin<R: Read>(mut reader: R, mut writers: Vec<Box<dyn Write + Send>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for w in writers.iter_mut() {
                    let _ = w.write_all(&buf[..n]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playfile::Command;

    #[test]
    fn empty_commands_is_rejected() {
        let orchestrator = Orchestrator::default();
        let network = Network {
            hosts: vec!["127.0.0.1".to_string()],
            ..Default::default()
        };
        let err = orchestrator.run(&network, &EnvVars::new(), &[]).unwrap_err();
        assert!(matches!(err, RunError::EmptyCommand));
    }

    #[test]
    fn runs_local_echo_end_to_end() {
        let orchestrator = Orchestrator::default();
        let network = Network {
            hosts: vec!["127.0.0.1".to_string()],
            ..Default::default()
        };
        let command = Command {
            run: Some("echo hello".to_string()),
            ..Default::default()
        };
        orchestrator.run(&network, &EnvVars::new(), &[&command]).unwrap();
    }
}
