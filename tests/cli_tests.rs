//! End-to-end tests for the fanout demo binary.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::process::{Command as StdCommand, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the fanout binary.
fn fanout() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("fanout").unwrap()
}

#[test]
fn test_square_across_forked_workers() {
    fanout()
        .args(["square", "--count", "6", "--workers", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("6 squares, sum 55"))
        .stdout(predicate::str::contains("[0, 1, 4, 9, 16, 25]"));
}

#[test]
fn test_square_across_threads() {
    fanout()
        .args(["square", "--count", "6", "--workers", "2", "--threads"])
        .assert()
        .success()
        .stdout(predicate::str::contains("6 squares, sum 55"));
}

#[test]
fn test_square_serially() {
    fanout()
        .args(["square", "--count", "4", "--workers", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("4 squares, sum 14"));
}

#[test]
fn test_help_lists_subcommands() {
    fanout()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("square"))
        .stdout(predicate::str::contains("sleep"));
}

/// Full distributed round trip on one machine: a wrapper script stands in
/// for ssh, so the master spawns real "remote" slaves that connect back
/// over TCP and serve array-mode jobs.
#[test]
fn test_distribute_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let shim = dir.path().join("fake-ssh");
    {
        let mut file = std::fs::File::create(&shim).unwrap();
        // Drop the hostname argument and run the remote command locally.
        writeln!(file, "#!/bin/sh\nshift\nexec /bin/sh -c \"$1\"").unwrap();
    }
    let mut perms = std::fs::metadata(&shim).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&shim, perms).unwrap();

    fanout()
        .args([
            "square",
            "--count",
            "6",
            "--workers",
            "2",
            "--distribute",
            "node-a",
            "--distribute",
            "node-b",
            "--via",
            shim.to_str().unwrap(),
            "--distribute-timeout",
            "30",
            "--local-address",
            "127.0.0.1",
        ])
        .timeout(Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("6 squares, sum 55"))
        .stdout(predicate::str::contains("[0, 1, 4, 9, 16, 25]"));
}

#[test]
fn test_slave_mode_exits_nonzero_when_master_is_gone() {
    // Port 1 refuses connections, so every connect-back fails and the
    // slave reports failure.
    fanout()
        .args(["square", "--count", "4", "--workers", "2"])
        .env("MASTER", "127.0.0.1|1")
        .timeout(Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("fanout worker"));
}

#[test]
fn test_interrupt_tears_the_pool_down() {
    let bin = env!("CARGO_BIN_EXE_fanout");
    let mut child = StdCommand::new(bin)
        .args(["sleep", "--jobs", "2", "--secs", "30", "--workers", "2"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn fanout sleep");

    // Give it time to fork its workers, then interrupt.
    std::thread::sleep(Duration::from_millis(700));
    let status = StdCommand::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .expect("failed to run kill");
    assert!(status.success());

    // The handler kills the workers and re-raises, so the process must die
    // well before its 30s of sleeping is up.
    let deadline = Instant::now() + Duration::from_secs(5);
    let exit = loop {
        match child.try_wait().expect("try_wait failed") {
            Some(status) => break status,
            None if Instant::now() > deadline => {
                let _ = child.kill();
                panic!("fanout did not exit after SIGINT");
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    };
    assert!(!exit.success(), "interrupt should not look like success");
}
