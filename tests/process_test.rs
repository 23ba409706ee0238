//! Supervised child processes exercising real executables.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use sluice_core::{PollReactor, Reactor};
use sluice_process::{Command, Process, SpawnOptions};

fn reactor() -> Arc<dyn Reactor> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    PollReactor::new().expect("reactor")
}

async fn wait_for_exit(process: &mut Process) -> i32 {
    tokio::time::timeout(Duration::from_secs(10), async {
        while process.running().expect("liveness poll") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("child did not exit in time");
    process.peek_exit_code().expect("exit code")
}

async fn read_to_end(reader: &mut sluice_pipe::PipeReader) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await.expect("read child output");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn exit_code_round_trip() {
    let reactor = reactor();
    let command = Command::new("/bin/sh").args(["-c", "exit 7"]);
    let mut process = Process::spawn(&reactor, command).expect("spawn");

    assert_eq!(wait_for_exit(&mut process).await, 7);
    // The code was cached when first observed.
    assert_eq!(process.peek_exit_code().expect("cached code"), 7);
    process.close().expect("close");
}

#[tokio::test]
async fn stdin_feeds_stdout_through_cat() {
    let reactor = reactor();
    let command = Command::new("/bin/cat")
        .options(SpawnOptions::MERGE_STDERR | SpawnOptions::INTERACTIVE);
    let mut process = Process::spawn(&reactor, command).expect("spawn");

    let mut stdin = process.take_stdin().expect("stdin half");
    stdin.write_all(b"echo through cat\n").await.expect("write");
    // Dropping the write half delivers EOF, which ends cat.
    drop(stdin);

    let mut stdout = process.take_stdout().expect("stdout half");
    let output = read_to_end(&mut stdout).await;
    assert_eq!(output, b"echo through cat\n");

    assert_eq!(wait_for_exit(&mut process).await, 0);
    process.close().expect("close");
}

#[tokio::test]
async fn merged_stderr_arrives_on_stdout() {
    let reactor = reactor();
    let command = Command::new("/bin/sh").args(["-c", "echo oops >&2"]);
    let mut process = Process::spawn(&reactor, command).expect("spawn");
    assert!(process.stderr().is_none());

    let mut stdout = process.take_stdout().expect("stdout half");
    let output = read_to_end(&mut stdout).await;
    assert_eq!(output, b"oops\n");
    assert_eq!(wait_for_exit(&mut process).await, 0);
}

#[tokio::test]
async fn split_stderr_keeps_streams_apart() {
    let reactor = reactor();
    let command = Command::new("/bin/sh")
        .args(["-c", "echo out; echo err >&2"])
        .options(SpawnOptions::empty());
    let mut process = Process::spawn(&reactor, command).expect("spawn");

    let mut stdout = process.take_stdout().expect("stdout half");
    let mut stderr = process.take_stderr().expect("stderr half");
    let (out, err) = tokio::join!(read_to_end(&mut stdout), read_to_end(&mut stderr));
    assert_eq!(out, b"out\n");
    assert_eq!(err, b"err\n");
    assert_eq!(wait_for_exit(&mut process).await, 0);
}

#[tokio::test]
async fn suspend_freezes_and_resume_revives() {
    let reactor = reactor();
    // A ticking child: suspended, its output stops; resumed, it flows
    // again.
    let command = Command::new("/bin/sh")
        .args(["-c", "while true; do echo tick; sleep 0.05; done"])
        .options(SpawnOptions::MERGE_STDERR | SpawnOptions::INTERACTIVE);
    let mut process = Process::spawn(&reactor, command).expect("spawn");
    let mut stdout = process.take_stdout().expect("stdout half");

    let mut chunk = [0u8; 256];
    let n = stdout.read(&mut chunk).await.expect("first tick");
    assert!(n > 0);

    process.suspend().expect("suspend");
    // Give an already-emitted tick time to drain through the pipe, then
    // expect silence.
    tokio::time::sleep(Duration::from_millis(200)).await;
    loop {
        match tokio::time::timeout(Duration::from_millis(200), stdout.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => continue,
            Ok(other) => panic!("unexpected read result while suspended: {other:?}"),
            Err(_) => break,
        }
    }
    assert!(process.running().expect("liveness poll"));

    process.resume().expect("resume");
    let n = tokio::time::timeout(Duration::from_secs(5), stdout.read(&mut chunk))
        .await
        .expect("no output after resume")
        .expect("read after resume");
    assert!(n > 0);

    process.kill().expect("kill");
    assert_eq!(wait_for_exit(&mut process).await, 128 + 9);
    process.close().expect("close");
}

#[tokio::test]
async fn kill_reports_signal_exit() {
    let reactor = reactor();
    let mut process =
        Process::spawn(&reactor, Command::new("/bin/sleep").arg("30")).expect("spawn");
    assert!(process.running().expect("liveness poll"));
    assert_eq!(process.peek_exit_code().expect("sentinel"), -1);

    process.kill().expect("kill");
    assert_eq!(wait_for_exit(&mut process).await, 128 + 9);
}

#[tokio::test]
async fn terminate_requests_shutdown() {
    let reactor = reactor();
    let mut process =
        Process::spawn(&reactor, Command::new("/bin/sleep").arg("30")).expect("spawn");
    process.terminate().expect("terminate");
    assert_eq!(wait_for_exit(&mut process).await, 128 + 15);
}

#[tokio::test]
async fn working_directory_applies_before_exec() {
    let reactor = reactor();
    let dir = tempfile::tempdir().expect("tempdir");
    let expected = dir.path().canonicalize().expect("canonical path");

    let command = Command::new("/bin/sh")
        .args(["-c", "pwd"])
        .current_dir(&expected);
    let mut process = Process::spawn(&reactor, command).expect("spawn");
    let mut stdout = process.take_stdout().expect("stdout half");
    let output = read_to_end(&mut stdout).await;
    let printed = String::from_utf8(output).expect("utf8");
    assert_eq!(printed.trim_end(), expected.to_str().expect("path"));
    assert_eq!(wait_for_exit(&mut process).await, 0);
}

#[tokio::test]
async fn environment_overrides_reach_the_child() {
    let reactor = reactor();
    let command = Command::new("/bin/sh")
        .args(["-c", "printf '%s' \"$SLUICE_MARKER\""])
        .env("SLUICE_MARKER", "present");
    let mut process = Process::spawn(&reactor, command).expect("spawn");
    let mut stdout = process.take_stdout().expect("stdout half");
    assert_eq!(read_to_end(&mut stdout).await, b"present");
    assert_eq!(wait_for_exit(&mut process).await, 0);
}
