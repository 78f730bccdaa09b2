pub(crate) mod config;
mod machine;

use std::{collections::VecDeque, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    event::ProcessEvent,
    host::HostError,
    spawn::{BoxedReader, BoxedWriter, ExitInfo, ProcessControl, SpawnedProcess, Spawner},
    ProcessConfig, ProcessId,
};

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Uninitialized,
    Starting,
    Started,
    Restarting,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessState {
    /// `starting`, `started` or `restarting`.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Restarting)
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn has_crashed(&self) -> bool {
        matches!(self, Self::Crashed)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Restarting => write!(f, "restarting"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Point-in-time view of a managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub state: ProcessState,
    pub previous_state: ProcessState,
    /// Crashes counted inside the current restart window.
    pub exits: u32,
    pub pid: Option<u32>,
    pub config: ProcessConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

/// Asynchronous notifications from the OS side of a managed process.
///
/// `instance` identifies the `ManagedProcess` that produced the signal, so a
/// process replaced under the same id never receives its predecessor's.
#[derive(Debug)]
pub(crate) enum ProcessSignal {
    Exited {
        id: ProcessId,
        instance: u64,
        generation: u64,
        info: ExitInfo,
    },
    SpawnFailed {
        id: ProcessId,
        instance: u64,
        generation: u64,
        reason: String,
    },
    Output {
        id: ProcessId,
        instance: u64,
        stream: OutputStream,
        data: String,
    },
    DecayExit {
        id: ProcessId,
        instance: u64,
    },
}

impl ProcessSignal {
    pub(crate) fn target(&self) -> (&ProcessId, u64) {
        match self {
            Self::Exited { id, instance, .. }
            | Self::SpawnFailed { id, instance, .. }
            | Self::Output { id, instance, .. }
            | Self::DecayExit { id, instance } => (id, *instance),
        }
    }
}

/// What the state machine needs from its surroundings.
pub(crate) struct MachineContext {
    pub(crate) spawner: Arc<dyn Spawner>,
    pub(crate) signals: mpsc::UnboundedSender<ProcessSignal>,
    pub(crate) events: broadcast::Sender<ProcessEvent>,
}

/// Resolved once when the awaited state is reached.
pub(crate) type Completion = oneshot::Sender<Result<(), HostError>>;

/// The live OS process currently owned by a managed process.
pub(crate) struct LiveChild {
    control: Box<dyn ProcessControl>,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    generation: u64,
}

/// Lifecycle state machine for exactly one child process.
pub(crate) struct ManagedProcess {
    pub(crate) id: ProcessId,
    pub(crate) instance: u64,
    pub(crate) config: ProcessConfig,
    pub(crate) state: ProcessState,
    pub(crate) previous_state: ProcessState,
    pub(crate) exits: u32,
    child: Option<LiveChild>,
    generation: u64,
    /// Set when the restart budget ran out; cleared by the next start.
    failed: bool,
    pending: VecDeque<machine::Input>,
    deferred: VecDeque<machine::Deferred>,
    start_waiters: Vec<Completion>,
    stop_waiters: Vec<Completion>,
    token: CancellationToken,
}

impl ManagedProcess {
    pub(crate) fn new(id: ProcessId, config: ProcessConfig, instance: u64) -> Self {
        Self {
            id,
            instance,
            config,
            state: ProcessState::Uninitialized,
            previous_state: ProcessState::Uninitialized,
            exits: 0,
            child: None,
            generation: 0,
            failed: false,
            pending: VecDeque::new(),
            deferred: VecDeque::new(),
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
            token: CancellationToken::new(),
        }
    }

    /// True when no OS process is owned and nothing will start one on its own:
    /// never started, stopped, crashed with the restart budget exhausted, or
    /// cleaned up.
    pub(crate) fn is_settled(&self) -> bool {
        if self.is_detached() {
            return true;
        }
        self.child.is_none()
            && match self.state {
                ProcessState::Uninitialized | ProcessState::Stopped => true,
                ProcessState::Crashed => self.failed,
                _ => false,
            }
    }

    /// True once [`cleanup`](Self::cleanup) has run. A detached process never
    /// spawns again.
    pub(crate) fn is_detached(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Records the process as stopped without it ever having run. Used when a
    /// redefinition is stopped before its successor was started.
    pub(crate) fn mark_stopped(&mut self) {
        self.previous_state = self.state;
        self.state = ProcessState::Stopped;
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.control.pid())
    }

    pub(crate) fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.id.clone(),
            state: self.state,
            previous_state: self.previous_state,
            exits: self.exits,
            pid: self.pid(),
            config: self.config.clone(),
        }
    }

    /// Forwards bytes to the child's stdin. Dropped when there is no live,
    /// piped child.
    pub(crate) fn write(&self, data: Vec<u8>) {
        let Some(stdin) = self.child.as_ref().and_then(|child| child.stdin.as_ref()) else {
            debug!(process = %self.id, "no stdin available, dropping write");
            return;
        };
        let _ = stdin.send(data);
    }

    /// Detaches every watcher, releases the handle and abandons pending waiters.
    pub(crate) fn cleanup(&mut self) {
        self.token.cancel();
        self.child = None;
        self.pending.clear();
        self.deferred.clear();
        for waiter in self
            .start_waiters
            .drain(..)
            .chain(self.stop_waiters.drain(..))
        {
            let _ = waiter.send(Err(HostError::Detached(self.id.clone())));
        }
    }

    /// Wires up the exit watcher, IO readers and stdin writer of a fresh child.
    fn attach(&mut self, ctx: &MachineContext, spawned: SpawnedProcess, generation: u64) {
        let token = self.token.child_token();

        let exit_token = token.clone();
        let exit_tx = ctx.signals.clone();
        let (id, instance) = (self.id.clone(), self.instance);
        let exit = spawned.exit;
        tokio::spawn(async move {
            tokio::select! {
                _ = exit_token.cancelled() => {}
                info = exit => {
                    let _ = exit_tx.send(ProcessSignal::Exited { id, instance, generation, info });
                }
            }
        });

        for (stream, reader) in [
            (OutputStream::Stdout, spawned.stdout),
            (OutputStream::Stderr, spawned.stderr),
        ] {
            if let Some(reader) = reader {
                tokio::spawn(forward_output(
                    reader,
                    stream,
                    self.id.clone(),
                    self.instance,
                    ctx.signals.clone(),
                    token.clone(),
                ));
            }
        }

        let stdin = spawned.stdin.map(|writer| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(feed_stdin(writer, rx, token.clone()));
            tx
        });

        self.child = Some(LiveChild {
            control: spawned.control,
            stdin,
            generation,
        });
    }
}

async fn forward_output(
    mut reader: BoxedReader,
    stream: OutputStream,
    id: ProcessId,
    instance: u64,
    signals: mpsc::UnboundedSender<ProcessSignal>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                let signal = ProcessSignal::Output {
                    id: id.clone(),
                    instance,
                    stream,
                    data,
                };
                if signals.send(signal).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(process = %id, ?stream, error = %err, "output stream closed");
                break;
            }
        }
    }
}

async fn feed_stdin(
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = token.cancelled() => break,
            data = rx.recv() => data,
        };
        let Some(data) = data else {
            break;
        };
        if let Err(err) = writer.write_all(&data).await {
            debug!(error = %err, "stdin closed");
            break;
        }
        let _ = writer.flush().await;
    }
}
