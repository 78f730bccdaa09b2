#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use process_host::{
    BoxedReader, BoxedWriter, EventKind, ExitInfo, ProcessConfig, ProcessControl,
    ProcessEvent, ProcessHostBuilder, ProcessHostHandle, SpawnSpec, SpawnedProcess, Spawner,
    StdioMode, Subscription,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::oneshot,
};

pub const CRASH_CODE: i32 = 100;

/// Stands in for the OS: every spawn yields a scripted child whose exit is
/// triggered by the test (`crash_*`) or by the supervisor (`kill`).
#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    specs: Vec<SpawnSpec>,
    children: Vec<FakeChild>,
    live: usize,
    max_live: usize,
    failing_spawns: usize,
    crash_on_spawn: bool,
    hold_on_kill: bool,
    kills: Vec<String>,
}

struct FakeChild {
    exit: Option<oneshot::Sender<ExitInfo>>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    stdin: Option<DuplexStream>,
}

impl FakeState {
    fn exit(&mut self, index: usize, info: ExitInfo) -> bool {
        let Some(tx) = self.children.get_mut(index).and_then(|child| child.exit.take()) else {
            return false;
        };
        self.live -= 1;
        let _ = tx.send(info);
        true
    }

    fn latest_live(&self) -> Option<usize> {
        self.children.iter().rposition(|child| child.exit.is_some())
    }
}

struct FakeControl {
    index: usize,
    state: Arc<Mutex<FakeState>>,
}

impl ProcessControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        Some(1000 + self.index as u32)
    }

    fn kill(&self, signal: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.kills.push(signal.to_string());
        if state.children[self.index].exit.is_none() {
            anyhow::bail!("no such process");
        }
        if !state.hold_on_kill {
            state.exit(self.index, ExitInfo::with_signal(signal));
        }
        Ok(())
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<SpawnedProcess> {
        let mut state = self.state.lock().unwrap();
        if state.failing_spawns > 0 {
            state.failing_spawns -= 1;
            anyhow::bail!("spawn refused for `{}`", spec.command);
        }

        let index = state.children.len();
        let (exit_tx, exit_rx) = oneshot::channel();
        let piped = spec.stdio == StdioMode::Pipe;
        let (stdout, stdout_writer) = pipe(piped);
        let (stderr, stderr_writer) = pipe(piped);
        let (stdin_writer, stdin) = pipe(piped);

        state.specs.push(spec.clone());
        state.children.push(FakeChild {
            exit: Some(exit_tx),
            stdout: stdout_writer,
            stderr: stderr_writer,
            stdin,
        });
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        if state.crash_on_spawn {
            state.exit(index, ExitInfo::with_code(CRASH_CODE));
        }

        Ok(SpawnedProcess {
            control: Box::new(FakeControl {
                index,
                state: self.state.clone(),
            }),
            stdout: stdout.map(|s| Box::new(s) as BoxedReader),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            stdin: stdin_writer.map(|s| Box::new(s) as BoxedWriter),
            exit: Box::pin(async move { exit_rx.await.unwrap_or_default() }),
        })
    }
}

fn pipe(enabled: bool) -> (Option<DuplexStream>, Option<DuplexStream>) {
    if enabled {
        let (a, b) = tokio::io::duplex(4096);
        (Some(a), Some(b))
    } else {
        (None, None)
    }
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crashes the most recently spawned child that is still running.
    pub fn crash(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.latest_live() {
            Some(index) => state.exit(index, ExitInfo::with_code(CRASH_CODE)),
            None => false,
        }
    }

    /// Crashes the `index`-th spawned child.
    pub fn crash_child(&self, index: usize) -> bool {
        self.state
            .lock()
            .unwrap()
            .exit(index, ExitInfo::with_code(CRASH_CODE))
    }

    /// Lets the most recent child exit as if it had honoured a kill.
    pub fn exit_latest(&self, signal: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.latest_live() {
            Some(index) => state.exit(index, ExitInfo::with_signal(signal)),
            None => false,
        }
    }

    pub fn fail_next_spawns(&self, count: usize) {
        self.state.lock().unwrap().failing_spawns = count;
    }

    pub fn crash_on_spawn(&self, enabled: bool) {
        self.state.lock().unwrap().crash_on_spawn = enabled;
    }

    /// When set, kills are recorded but children keep running until
    /// [`exit_latest`](Self::exit_latest).
    pub fn hold_on_kill(&self, enabled: bool) {
        self.state.lock().unwrap().hold_on_kill = enabled;
    }

    pub fn spawned(&self) -> usize {
        self.state.lock().unwrap().children.len()
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn kills(&self) -> Vec<String> {
        self.state.lock().unwrap().kills.clone()
    }

    pub fn last_spec(&self) -> Option<SpawnSpec> {
        self.state.lock().unwrap().specs.last().cloned()
    }

    pub async fn emit_stdout(&self, data: &str) {
        self.emit(data, true).await
    }

    pub async fn emit_stderr(&self, data: &str) {
        self.emit(data, false).await
    }

    async fn emit(&self, data: &str, stdout: bool) {
        let (index, mut writer) = {
            let mut state = self.state.lock().unwrap();
            let index = state.children.len() - 1;
            let child = &mut state.children[index];
            let writer = if stdout {
                child.stdout.take()
            } else {
                child.stderr.take()
            };
            (index, writer.expect("child was not spawned with piped stdio"))
        };
        writer.write_all(data.as_bytes()).await.unwrap();
        let mut state = self.state.lock().unwrap();
        let child = &mut state.children[index];
        if stdout {
            child.stdout = Some(writer);
        } else {
            child.stderr = Some(writer);
        }
    }

    /// Reads exactly `len` bytes written to the latest child's stdin.
    pub async fn read_stdin(&self, len: usize) -> String {
        let (index, mut reader) = {
            let mut state = self.state.lock().unwrap();
            let index = state.children.len() - 1;
            let reader = state.children[index]
                .stdin
                .take()
                .expect("child was not spawned with piped stdio");
            (index, reader)
        };
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.unwrap();
        self.state.lock().unwrap().children[index].stdin = Some(reader);
        String::from_utf8(buf).unwrap()
    }
}

pub fn create_host(spawner: &FakeSpawner) -> ProcessHostHandle {
    ProcessHostBuilder::new()
        .with_spawner(spawner.clone())
        .build()
        .run()
}

pub fn node_config(script: &str) -> ProcessConfig {
    ProcessConfig::new("node").with_args([script])
}

pub async fn next_event(subscription: &mut Subscription) -> ProcessEvent {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for a process event")
        .expect("event stream closed")
}

/// Collects event kinds until (and including) the first event of `kind`.
pub async fn events_until(subscription: &mut Subscription, kind: EventKind) -> Vec<ProcessEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(subscription).await;
        let done = event.kind == kind;
        events.push(event);
        if done {
            return events;
        }
    }
}

pub fn kinds(events: &[ProcessEvent]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

/// Kinds of every event already buffered on the subscription.
pub fn drain(subscription: &mut Subscription) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Some(event) = subscription.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

/// Gives spawned tasks a chance to deliver their requests to the host.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
