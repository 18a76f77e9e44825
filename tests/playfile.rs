//! Integration tests driving the Playfile loader end to end, loading actual
//! files from disk rather than in-memory strings.

use std::io::Write;

use play::error::PlayfileError;
use play::Playfile;

fn write_playfile(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("Playfile.yml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn loads_networks_commands_and_books_in_declaration_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_playfile(
        &dir,
        r#"
version: "1.0"
networks:
  web:
    hosts: ["127.0.0.1"]
  db:
    hosts: ["127.0.0.2"]
commands:
  build:
    run: "echo building"
  deploy:
    run: "echo deploying"
books:
  release: ["build", "deploy"]
"#,
    );

    let playfile = Playfile::from_file(&path).unwrap();
    assert_eq!(
        playfile.networks.keys().cloned().collect::<Vec<_>>(),
        vec!["web", "db"]
    );
    assert_eq!(
        playfile.commands.keys().cloned().collect::<Vec<_>>(),
        vec!["build", "deploy"]
    );

    let network = playfile.network("web").unwrap();
    assert_eq!(network.hosts, vec!["127.0.0.1"]);

    let commands = playfile.book_commands("release").unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].run.as_deref(), Some("echo building"));
    assert_eq!(commands[1].run.as_deref(), Some("echo deploying"));
}

#[test]
fn unknown_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_playfile(&dir, "version: \"2.0\"\nnetworks: {}\n");

    match Playfile::from_file(&path) {
        Err(PlayfileError::Version(v)) => assert_eq!(v, "2.0"),
        other => panic!("expected Version error, got {other:?}"),
    }
}

#[test]
fn unknown_book_and_command_report_their_own_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_playfile(
        &dir,
        r#"
version: "1.0"
commands:
  build:
    run: "echo hi"
books:
  release: ["build", "missing"]
"#,
    );
    let playfile = Playfile::from_file(&path).unwrap();

    match playfile.book_commands("release") {
        Err(PlayfileError::UnknownCommand(name)) => assert_eq!(name, "missing"),
        other => panic!("expected UnknownCommand, got {other:?}"),
    }

    match playfile.book_commands("nope") {
        Err(PlayfileError::UnknownBook(name)) => assert_eq!(name, "nope"),
        other => panic!("expected UnknownBook, got {other:?}"),
    }
}
