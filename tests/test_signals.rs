//! Delivers real termination signals to the test process. Kept in its own
//! binary so no other test's handlers observe them.
#![cfg(unix)]

mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::*;
use nix::sys::signal::{raise, Signal};
use process_host::{ExitHook, ProcessState};

#[tokio::test]
async fn test_signal_after_remove_listeners_only_terminates() {
    let spawner = FakeSpawner::new();
    let host = create_host(&spawner);
    host.start("a", Some(node_config("a.js"))).await.unwrap();
    let codes = Arc::new(Mutex::new(Vec::new()));
    let exit: ExitHook = {
        let codes = codes.clone();
        Arc::new(move |code| codes.lock().unwrap().push(code))
    };
    let guard = host.install_shutdown_handlers_with(exit).unwrap();

    guard.remove_listeners();
    raise(Signal::SIGTERM).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while codes.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(*codes.lock().unwrap(), vec![143]);
    assert!(!guard.is_triggered());
    assert_eq!(
        host.get_process_status("a").await.unwrap(),
        Some(ProcessState::Started)
    );
}
