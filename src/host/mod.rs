pub(crate) mod builder;
pub(crate) mod handle;
pub(crate) mod shutdown;

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use handle::{HostError, ProcessHostHandle};

use crate::{
    process::{Completion, MachineContext, ManagedProcess, ProcessSignal},
    ProcessConfig, ProcessId,
};
use handle::HostMessage;

/// A redefinition waiting for the current instance of a process to stop.
struct PendingSwap {
    config: ProcessConfig,
    /// Resolved once the successor is installed.
    created: Vec<Completion>,
    /// Non-empty when the successor must be started once installed.
    started: Vec<Completion>,
    /// A stop arrived after the last start; the successor is left stopped.
    stopped: bool,
}

impl PendingSwap {
    fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            created: Vec::new(),
            started: Vec::new(),
            stopped: false,
        }
    }

    fn waiters(self) -> impl Iterator<Item = Completion> {
        self.created.into_iter().chain(self.started)
    }
}

/// Owns every managed process and drives their state machines.
///
/// All transitions happen inside one supervision loop: commands from
/// [`ProcessHostHandle`]s and notifications from the OS side (exits, output,
/// timers) are taken one at a time and each runs to completion. Events raised
/// by a process are broadcast to subscribers tagged with its id.
pub struct ProcessHost {
    processes: HashMap<ProcessId, ManagedProcess>,
    swaps: HashMap<ProcessId, PendingSwap>,
    initial: Vec<(ProcessId, ProcessConfig)>,
    context: MachineContext,
    next_instance: u64,
    shutdown_waiters: Option<Vec<oneshot::Sender<()>>>,
    finished: CancellationToken,
    external_tx: mpsc::UnboundedSender<HostMessage>,
    external_rx: mpsc::UnboundedReceiver<HostMessage>,
    internal_rx: mpsc::UnboundedReceiver<ProcessSignal>,
}

impl ProcessHost {
    /// Runs the host, consuming it and returning a handle for external control.
    ///
    /// Processes registered on the builder are created, and those flagged with
    /// `start` are started, before any command sent through the handle.
    pub fn run(self) -> ProcessHostHandle {
        let handle = ProcessHostHandle::new(
            self.external_tx.clone(),
            self.context.events.clone(),
            self.finished.clone(),
        );
        tokio::spawn(async move {
            self.run_and_supervise().await;
        });
        handle
    }

    async fn run_and_supervise(mut self) {
        self.register_initial();
        self.supervise().await;
        for waiter in self.shutdown_waiters.take().into_iter().flatten() {
            let _ = waiter.send(());
        }
        self.finished.cancel();
        info!("process host stopped");
    }

    fn register_initial(&mut self) {
        for (id, config) in std::mem::take(&mut self.initial) {
            // Nobody awaits these; failures are logged by the state machine.
            let (reply, _) = oneshot::channel();
            if config.start {
                self.start(id, Some(config), reply);
            } else {
                self.create(id, config, reply);
            }
        }
    }

    async fn supervise(&mut self) {
        loop {
            tokio::select! {
                Some(signal) = self.internal_rx.recv() => {
                    self.handle_signal(signal);
                },
                Some(msg) = self.external_rx.recv() => {
                    self.handle_message(msg);
                },
                else => break,
            }
            if self.shutdown_complete() {
                break;
            }
        }
    }

    fn handle_message(&mut self, msg: HostMessage) {
        match msg {
            HostMessage::Create { id, config, reply } => {
                if self.shutdown_waiters.is_some() {
                    let _ = reply.send(Err(HostError::HostClosed));
                    return;
                }
                self.create(id, config, reply);
            }
            HostMessage::Start { id, config, reply } => {
                if self.shutdown_waiters.is_some() {
                    let _ = reply.send(Err(HostError::HostClosed));
                    return;
                }
                self.start(id, config, reply);
            }
            HostMessage::Stop { id, reply } => {
                if let Some(swap) = self.swaps.get_mut(&id) {
                    debug!(process = %id, "stop overtakes a pending redefinition");
                    for waiter in swap.started.drain(..) {
                        let _ = waiter.send(Err(HostError::Cancelled(id.clone())));
                    }
                    swap.stopped = true;
                }
                let Some(process) = self.processes.get_mut(&id) else {
                    let _ = reply.send(Err(HostError::NotFound(id)));
                    return;
                };
                process.stop(&self.context, Some(reply));
                self.settle(&id);
            }
            HostMessage::Write { id, data } => {
                if let Some(process) = self.processes.get(&id) {
                    process.write(data);
                }
            }
            HostMessage::Cleanup { id, reply } => {
                let Some(process) = self.processes.get_mut(&id) else {
                    let _ = reply.send(Err(HostError::NotFound(id)));
                    return;
                };
                process.cleanup();
                let _ = reply.send(Ok(()));
                self.settle(&id);
            }
            HostMessage::Snapshot { id, reply } => {
                let _ = reply.send(self.processes.get(&id).map(ManagedProcess::snapshot));
            }
            HostMessage::SnapshotAll { reply } => {
                let _ = reply.send(self.processes.values().map(ManagedProcess::snapshot).collect());
            }
            HostMessage::Shutdown { reply } => {
                info!(processes = self.processes.len(), "shutting down process host");
                for (_, swap) in self.swaps.drain() {
                    for waiter in swap.waiters() {
                        let _ = waiter.send(Err(HostError::HostClosed));
                    }
                }
                for process in self.processes.values_mut() {
                    process.stop(&self.context, None);
                }
                self.shutdown_waiters.get_or_insert_with(Vec::new).push(reply);
            }
        }
    }

    fn handle_signal(&mut self, signal: ProcessSignal) {
        let (id, instance) = signal.target();
        let id = id.clone();
        match self.processes.get_mut(&id) {
            Some(process) if process.instance == instance => {
                process.handle_signal(&self.context, signal);
            }
            _ => {
                debug!(process = %id, instance, "dropping signal for a replaced process");
                return;
            }
        }
        self.settle(&id);
    }

    /// Registers a process, replacing any existing definition. A replaced
    /// process that still owns an OS process is stopped first.
    fn create(&mut self, id: ProcessId, config: ProcessConfig, reply: Completion) {
        if let Err(source) = config.validate() {
            let _ = reply.send(Err(HostError::InvalidConfig { id, source }));
            return;
        }
        if let Some(swap) = self.swaps.get_mut(&id) {
            swap.config = config;
            swap.created.push(reply);
            return;
        }
        if self.is_live(&id) {
            self.begin_swap(id, config, false, reply);
        } else {
            self.install(id, config);
            let _ = reply.send(Ok(()));
        }
    }

    fn start(&mut self, id: ProcessId, config: Option<ProcessConfig>, reply: Completion) {
        if let Some(Err(source)) = config.as_ref().map(ProcessConfig::validate) {
            let _ = reply.send(Err(HostError::InvalidConfig { id, source }));
            return;
        }
        if let Some(swap) = self.swaps.get_mut(&id) {
            if let Some(config) = config {
                swap.config = config;
            }
            swap.started.push(reply);
            swap.stopped = false;
            return;
        }

        let Some(config) = config else {
            match self.processes.get_mut(&id) {
                Some(process) => process.start(&self.context, vec![reply]),
                None => {
                    let _ = reply.send(Err(HostError::UnknownProcess(id)));
                }
            }
            return;
        };

        if self.is_live(&id) {
            debug!(process = %id, "redefining a live process, stopping the current instance");
            self.begin_swap(id, config, true, reply);
        } else {
            self.install(id.clone(), config);
            if let Some(process) = self.processes.get_mut(&id) {
                process.start(&self.context, vec![reply]);
            }
        }
    }

    fn is_live(&self, id: &ProcessId) -> bool {
        self.processes
            .get(id)
            .is_some_and(|process| !process.is_settled())
    }

    fn begin_swap(&mut self, id: ProcessId, config: ProcessConfig, start: bool, reply: Completion) {
        let mut swap = PendingSwap::new(config);
        if start {
            swap.started.push(reply);
        } else {
            swap.created.push(reply);
        }
        self.swaps.insert(id.clone(), swap);
        if let Some(process) = self.processes.get_mut(&id) {
            process.stop(&self.context, None);
        }
        self.settle(&id);
    }

    /// Completes a pending swap once the current instance has settled.
    fn settle(&mut self, id: &ProcessId) {
        let settled = self
            .processes
            .get(id)
            .map_or(true, |process| process.is_settled());
        if !settled {
            return;
        }
        let Some(swap) = self.swaps.remove(id) else {
            return;
        };
        debug!(
            process = %id,
            start = !swap.started.is_empty(),
            stopped = swap.stopped,
            "previous instance settled, installing new definition"
        );
        self.install(id.clone(), swap.config);
        let Some(process) = self.processes.get_mut(id) else {
            return;
        };
        for waiter in swap.created {
            let _ = waiter.send(Ok(()));
        }
        if !swap.started.is_empty() {
            process.start(&self.context, swap.started);
        } else if swap.stopped {
            process.mark_stopped();
        }
    }

    fn install(&mut self, id: ProcessId, config: ProcessConfig) {
        self.next_instance += 1;
        let process = ManagedProcess::new(id.clone(), config, self.next_instance);
        if let Some(mut previous) = self.processes.insert(id, process) {
            previous.cleanup();
        }
    }

    fn shutdown_complete(&mut self) -> bool {
        if self.shutdown_waiters.is_none() {
            return false;
        }
        let unsettled = self
            .processes
            .values()
            .filter(|process| !process.is_settled())
            .count();
        if unsettled > 0 {
            debug!(unsettled, "waiting for processes to stop");
            return false;
        }
        true
    }
}
