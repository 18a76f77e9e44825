//! Translates a [`Command`] into one or more executable [`Book`]s, each
//! paired with the clients that should run it.

use std::borrow::Cow;
use std::io::Read;
use std::path::Path;

use crate::client::{Client, LocalClient, SharedClient};
use crate::error::PlayfileError;
use crate::host::HostAddress;
use crate::playfile::Command;

/// A lazy source of bytes to feed into a book's stdin, e.g. a tar stream for
/// an upload or the process's own stdin when `stdin: true`.
pub enum Input {
    /// A tar archive built on demand from a local directory.
    Tar(Box<dyn Read + Send>),
    /// The orchestrator's own stdin, shared across every client in the book.
    ProcessStdin,
}

/// One executable shell payload paired with the clients that run it.
pub struct Book {
    pub clients: Vec<SharedClient>,
    pub run: String,
    pub input: Option<Input>,
    pub once: bool,
    pub tty: bool,
}

impl Book {
    fn new(run: String) -> Self {
        Self {
            clients: Vec::new(),
            run,
            input: None,
            once: false,
            tty: false,
        }
    }
}

/// Builds the ordered sequence of books for `command`, against the
/// (already-connected) `clients`, then applies the command's client
/// assignment policy (`once` / `serial` / default-to-all) to each emitted
/// book — in that order: uploads, then script, then run. Uploads always run
/// against the full `clients` list; when `command.locally` is set, the
/// script and run books instead run against a single freshly-connected
/// [`LocalClient`], never the network's own clients.
pub fn build(
    command: &Command,
    clients: &[SharedClient],
    debug: bool,
    cwd: &Path,
    env_prelude: &str,
) -> Result<Vec<Book>, PlayfileError> {
    let mut books = Vec::new();
    let upload_count = command.uploads.len();

    for (_name, upload) in command.uploads.iter() {
        let src = resolve_local_path(cwd, &upload.src)?;
        let reader = tar_stream_reader(&src, &upload.filter)?;
        let dst = shell_escape::escape(Cow::Borrowed(upload.dst.as_str()));
        let mut book = Book::new(format!("mkdir -p {dst} && tar -xf - -C {dst}"));
        book.input = Some(Input::Tar(reader));
        books.push(book);
    }

    if let Some(script) = &command.script {
        let contents = std::fs::read_to_string(script)?;
        books.push(Book::new(contents));
    }

    if let Some(run) = &command.run {
        let run = if debug {
            format!("set -x;{run}")
        } else {
            run.clone()
        };
        let mut book = Book::new(run);
        if command.stdin {
            book.input = Some(Input::ProcessStdin);
        }
        books.push(book);
    }

    let local_client = if command.locally {
        Some(local_override_client(env_prelude))
    } else {
        None
    };

    for (i, book) in books.iter_mut().enumerate() {
        if i < upload_count {
            assign_clients(book, clients, command);
            continue;
        }
        match &local_client {
            Some(local) => assign_clients(book, std::slice::from_ref(local), command),
            None => assign_clients(book, clients, command),
        }
    }

    Ok(books)
}

/// A single, freshly-connected [`LocalClient`] substituted for the whole
/// network when a command sets `locally: true`.
fn local_override_client(env_prelude: &str) -> SharedClient {
    let mut client = LocalClient::new(env_prelude.to_string());
    client
        .connect(HostAddress {
            user: whoami::username(),
            passwd: None,
            host: "localhost".to_string(),
            port: 22,
        })
        .expect("a freshly constructed LocalClient always connects");
    SharedClient::new(Box::new(client))
}

/// Expands a book in place into one or more clones, one per `serial` batch,
/// or narrows it to the first client when `once` is set.
fn assign_clients(book: &mut Book, clients: &[SharedClient], command: &Command) {
    if command.once {
        book.once = true;
        book.clients = clients.first().cloned().into_iter().collect();
        return;
    }
    book.clients = clients.to_vec();
}

/// Applies `serial` batching, producing clones of `book` for every
/// contiguous chunk of `clients` of size `serial`. Returns a single book
/// (the original) unchanged when `serial` is 0 (every client runs it) or
/// when `once` already narrowed it to one client.
pub fn serial_batches(book: &Book, serial: usize) -> Vec<Book> {
    if serial == 0 || book.once {
        return Vec::new();
    }
    book.clients
        .chunks(serial)
        .map(|chunk| Book {
            clients: chunk.to_vec(),
            run: book.run.clone(),
            input: None,
            once: false,
            tty: book.tty,
        })
        .collect()
}

fn resolve_local_path(cwd: &Path, path: &str) -> Result<std::path::PathBuf, PlayfileError> {
    let script = format!("cd {:?} && echo -n {:?}", cwd, path);
    let output = std::process::Command::new("bash")
        .arg("-c")
        .arg(script)
        .output()?;
    Ok(std::path::PathBuf::from(
        String::from_utf8_lossy(&output.stdout).into_owned(),
    ))
}

fn tar_stream_reader(
    root: &Path,
    filter: &[String],
) -> Result<Box<dyn Read + Send>, PlayfileError> {
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        let name = root.file_name().unwrap_or_default();
        if root.is_dir() {
            append_dir_filtered(&mut builder, name.as_ref(), root, filter)?;
        } else {
            let mut file = std::fs::File::open(root)?;
            builder.append_file(name, &mut file)?;
        }
        builder.finish()?;
    }
    Ok(Box::new(std::io::Cursor::new(buf)))
}

/// Like `tar::Builder::append_dir_all`, but skips entries whose path
/// (relative to `src`) contains any of `filter`'s substrings.
fn append_dir_filtered<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dest: &Path,
    src: &Path,
    filter: &[String],
) -> Result<(), PlayfileError> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let dest_path = dest.join(&name);
        let src_path = entry.path();
        if is_filtered_out(&dest_path, filter) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            append_dir_filtered(builder, &dest_path, &src_path, filter)?;
        } else {
            let mut file = std::fs::File::open(&src_path)?;
            builder.append_file(&dest_path, &mut file)?;
        }
    }
    Ok(())
}

fn is_filtered_out(path: &Path, filter: &[String]) -> bool {
    let path = path.to_string_lossy();
    filter.iter().any(|pattern| path.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(run: &str) -> Command {
        Command {
            run: Some(run.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn once_assigns_single_client() {
        let mut cmd = command("echo hi");
        cmd.once = true;
        let clients: Vec<SharedClient> = (0..5).map(|_| SharedClient::test_double()).collect();
        let books = build(&cmd, &clients, false, Path::new("."), "").unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].clients.len(), 1);
        assert!(books[0].once);
    }

    #[test]
    fn serial_splits_into_batches() {
        let cmd = command("echo hi");
        let clients: Vec<SharedClient> = (0..5).map(|_| SharedClient::test_double()).collect();
        let books = build(&cmd, &clients, false, Path::new("."), "").unwrap();
        let batches = serial_batches(&books[0], 2);
        assert_eq!(
            batches.iter().map(|b| b.clients.len()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
    }

    #[test]
    fn default_assigns_all_clients() {
        let cmd = command("echo hi");
        let clients: Vec<SharedClient> = (0..3).map(|_| SharedClient::test_double()).collect();
        let books = build(&cmd, &clients, false, Path::new("."), "").unwrap();
        assert_eq!(books[0].clients.len(), 3);
    }

    #[test]
    fn locally_overrides_remote_clients_with_a_single_local_client() {
        let mut cmd = command("echo hi");
        cmd.locally = true;
        let clients: Vec<SharedClient> = (0..5).map(|_| SharedClient::test_double()).collect();
        let books = build(&cmd, &clients, false, Path::new("."), "").unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].clients.len(), 1);
        assert!(!clients.iter().any(|c| c.ptr_eq(&books[0].clients[0])));
    }

    #[test]
    fn locally_does_not_affect_uploads() {
        let mut cmd = command("echo hi");
        cmd.locally = true;
        cmd.uploads.insert(
            "payload".to_string(),
            crate::playfile::Upload {
                src: ".".to_string(),
                dst: "/tmp/x".to_string(),
                filter: Vec::new(),
            },
        );
        let clients: Vec<SharedClient> = (0..3).map(|_| SharedClient::test_double()).collect();
        let books = build(&cmd, &clients, false, Path::new("."), "").unwrap();
        assert_eq!(books.len(), 2);
        assert_eq!(books[0].clients.len(), 3);
        assert_eq!(books[1].clients.len(), 1);
    }
}
