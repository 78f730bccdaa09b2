//! Runs real child processes through `/bin/sh`.
#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{events_until, next_event};
use process_host::{
    EventFilter, EventKind, HostError, ProcessConfig, ProcessHostBuilder, ProcessHostHandle,
    ProcessState, StdioMode,
};

fn live_host() -> ProcessHostHandle {
    ProcessHostBuilder::default().build().run()
}

fn sh(script: &str) -> ProcessConfig {
    ProcessConfig::new("/bin/sh")
        .with_args(["-c", script])
        .with_stdio(StdioMode::Pipe)
}

#[tokio::test]
async fn test_stdout_is_captured_and_stop_terminates() {
    let host = live_host();
    let mut events = host.subscribe(EventFilter::all().process("greeter"));

    let process = host
        .start("greeter", Some(sh("echo hello; exec sleep 30")))
        .await
        .unwrap();
    let output = events_until(&mut events, EventKind::Stdout).await;
    assert_eq!(output.last().unwrap().output(), Some("hello\n"));
    assert!(process.snapshot().await.unwrap().pid.is_some());

    tokio::time::timeout(Duration::from_secs(10), process.stop())
        .await
        .unwrap()
        .unwrap();

    let exited = events_until(&mut events, EventKind::Exited).await;
    let info = exited.last().unwrap().exit_info().unwrap();
    assert_eq!(info.signal.as_deref(), Some("SIGTERM"));
    assert_eq!(process.state().await.unwrap(), ProcessState::Stopped);
}

#[tokio::test]
async fn test_stdin_round_trip() {
    let host = live_host();
    let process = host.start("cat", Some(sh("exec cat"))).await.unwrap();
    let mut stdout = process.subscribe_to(EventFilter::all().kind(EventKind::Stdout));

    process.write("ping\n").unwrap();

    let event = next_event(&mut stdout).await;
    assert_eq!(event.output(), Some("ping\n"));
    process.stop().await.unwrap();
}

#[tokio::test]
async fn test_env_and_cwd_are_applied() {
    let host = live_host();
    let config = sh("echo \"$GREETING from $(pwd)\"; exec sleep 30")
        .with_env("GREETING", "hi")
        .with_cwd("/");
    let mut stdout = host.subscribe(EventFilter::all().kind(EventKind::Stdout));

    let process = host.start("env", Some(config)).await.unwrap();

    let event = next_event(&mut stdout).await;
    assert_eq!(event.output(), Some("hi from /\n"));
    process.stop().await.unwrap();
}

#[tokio::test]
async fn test_exiting_process_exhausts_restart_limit() {
    let host = live_host();
    let mut events = host.subscribe(EventFilter::all().process("quitter"));
    let config = sh("exit 3")
        .with_restart_limit(1)
        .with_restart_window(Duration::from_secs(60));

    host.start("quitter", Some(config)).await.ok();
    let seen = events_until(&mut events, EventKind::Failed).await;

    let codes = seen
        .iter()
        .filter_map(|event| event.exit_info())
        .map(|info| info.code)
        .collect::<Vec<_>>();
    assert_eq!(codes, vec![Some(3), Some(3)]);
    assert_eq!(
        host.get_process_status("quitter").await.unwrap(),
        Some(ProcessState::Crashed)
    );
}

#[tokio::test]
async fn test_missing_executable_is_a_crash() {
    let host = live_host();
    let config = ProcessConfig::new("/nonexistent/definitely-not-here")
        .with_restart_limit(0)
        .with_restart_window(Duration::from_secs(60));

    let err = host.start("ghost", Some(config)).await.unwrap_err();

    assert!(matches!(err, HostError::RestartLimitExceeded(_)));
}
