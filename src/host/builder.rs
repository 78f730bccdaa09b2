use std::{collections::HashMap, sync::Arc};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    process::MachineContext,
    spawn::{CommandSpawner, Spawner},
    ProcessConfig, ProcessHost, ProcessId,
};

/// Builds a [`ProcessHost`].
///
/// Processes added here are registered when the host starts running; those
/// whose configuration sets `start` are started right away.
pub struct ProcessHostBuilder {
    processes: Vec<(ProcessId, ProcessConfig)>,
    spawner: Arc<dyn Spawner>,
    event_capacity: usize,
}

impl ProcessHostBuilder {
    /// Creates a new builder that launches processes with [`CommandSpawner`].
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            spawner: Arc::new(CommandSpawner),
            event_capacity: 1024,
        }
    }

    /// Registers a process under `id`. A later registration of the same id wins.
    pub fn with_process(mut self, id: &str, config: ProcessConfig) -> Self {
        self.processes.retain(|(existing, _)| existing != id);
        self.processes.push((id.into(), config));
        self
    }

    /// Replaces the capability used to launch OS processes.
    pub fn with_spawner(mut self, spawner: impl Spawner) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }

    /// Sets how many events are buffered for slow subscribers before they lag.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Constructs the `ProcessHost` with the configured settings.
    pub fn build(self) -> ProcessHost {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.event_capacity);
        ProcessHost {
            processes: HashMap::new(),
            swaps: HashMap::new(),
            initial: self.processes,
            context: MachineContext {
                spawner: self.spawner,
                signals: internal_tx,
                events,
            },
            next_instance: 0,
            shutdown_waiters: None,
            finished: CancellationToken::new(),
            external_tx: user_tx,
            external_rx: user_rx,
            internal_rx,
        }
    }
}

impl Default for ProcessHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}
