//! End-to-end runs against the local client, since spinning up a real SSH
//! server is out of scope for these tests.

use play::env::EnvVars;
use play::error::RunError;
use play::{Command, Network, Orchestrator};

#[test]
fn runs_a_book_against_localhost_and_reports_exit_status() {
    let network = Network {
        hosts: vec!["127.0.0.1".to_string()],
        ..Default::default()
    };
    let command = Command {
        run: Some("exit 0".to_string()),
        ..Default::default()
    };
    Orchestrator::default()
        .run(&network, &EnvVars::new(), &[&command])
        .unwrap();
}

#[test]
fn empty_network_after_connect_failures_reports_empty_client() {
    // A network with zero hosts never produces a survivor.
    let network = Network::default();
    let command = Command {
        run: Some("echo hi".to_string()),
        ..Default::default()
    };
    let err = Orchestrator::default()
        .run(&network, &EnvVars::new(), &[&command])
        .unwrap_err();
    assert!(matches!(err, RunError::EmptyClient));
}

#[test]
fn serial_batching_runs_every_batch_without_error() {
    // Three local "clients" would require three local listeners; instead
    // this exercises the serial path against a single host, which still
    // produces the single batch of size 1 and must run cleanly.
    let network = Network {
        hosts: vec!["127.0.0.1".to_string()],
        ..Default::default()
    };
    let command = Command {
        run: Some("echo batch".to_string()),
        serial: 1,
        ..Default::default()
    };
    Orchestrator::default()
        .run(&network, &EnvVars::new(), &[&command])
        .unwrap();
}

#[test]
fn once_restricts_execution_to_a_single_client() {
    let network = Network {
        hosts: vec!["127.0.0.1".to_string()],
        ..Default::default()
    };
    let command = Command {
        run: Some("echo once".to_string()),
        once: true,
        ..Default::default()
    };
    Orchestrator::default()
        .run(&network, &EnvVars::new(), &[&command])
        .unwrap();
}
