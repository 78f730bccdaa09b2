use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    event::{EventFilter, ProcessEvent, Subscription},
    process::{Completion, ProcessSnapshot, ProcessState},
    ConfigError, ProcessConfig, ProcessId,
};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Cannot call start without an identifier.")]
    MissingIdentifier,

    #[error("Cannot call start on non-existent '{0}' without configuration.")]
    UnknownProcess(ProcessId),

    #[error("process '{id}' has an invalid configuration: {source}")]
    InvalidConfig {
        id: ProcessId,
        #[source]
        source: ConfigError,
    },

    #[error("process '{0}' crashed more often than its restart limit allows")]
    RestartLimitExceeded(ProcessId),

    /// `stop`, `restart` or `cleanup` named an id nothing is registered under.
    #[error("no process is registered under '{0}'")]
    NotFound(ProcessId),

    /// A pending start was overtaken by a later `stop`.
    #[error("start of process '{0}' was cancelled by a stop")]
    Cancelled(ProcessId),

    #[error("process '{0}' has been cleaned up")]
    Detached(ProcessId),

    #[error("the process host is no longer running")]
    HostClosed,
}

/// Commands sent from handles to the supervision loop.
#[derive(Debug)]
pub(crate) enum HostMessage {
    Create {
        id: ProcessId,
        config: ProcessConfig,
        reply: Completion,
    },
    Start {
        id: ProcessId,
        config: Option<ProcessConfig>,
        reply: Completion,
    },
    Stop {
        id: ProcessId,
        reply: Completion,
    },
    Write {
        id: ProcessId,
        data: Vec<u8>,
    },
    Cleanup {
        id: ProcessId,
        reply: Completion,
    },
    Snapshot {
        id: ProcessId,
        reply: oneshot::Sender<Option<ProcessSnapshot>>,
    },
    SnapshotAll {
        reply: oneshot::Sender<Vec<ProcessSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type Pending = oneshot::Receiver<Result<(), HostError>>;

async fn settled(pending: Pending) -> Result<(), HostError> {
    pending.await.map_err(|_| HostError::HostClosed)?
}

/// Cloneable control surface of a running [`ProcessHost`](crate::ProcessHost).
#[derive(Debug, Clone)]
pub struct ProcessHostHandle {
    tx: mpsc::UnboundedSender<HostMessage>,
    events: broadcast::Sender<ProcessEvent>,
    finished: CancellationToken,
}

impl ProcessHostHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<HostMessage>,
        events: broadcast::Sender<ProcessEvent>,
        finished: CancellationToken,
    ) -> Self {
        Self {
            tx,
            events,
            finished,
        }
    }

    fn send(&self, msg: HostMessage) -> Result<(), HostError> {
        self.tx.send(msg).map_err(|_| HostError::HostClosed)
    }

    fn request_start(&self, id: ProcessId, config: Option<ProcessConfig>) -> Result<Pending, HostError> {
        if id.is_empty() {
            return Err(HostError::MissingIdentifier);
        }
        let (reply, pending) = oneshot::channel();
        self.send(HostMessage::Start { id, config, reply })?;
        Ok(pending)
    }

    fn request_create(&self, id: ProcessId, config: ProcessConfig) -> Result<Pending, HostError> {
        if id.is_empty() {
            return Err(HostError::MissingIdentifier);
        }
        let (reply, pending) = oneshot::channel();
        self.send(HostMessage::Create { id, config, reply })?;
        Ok(pending)
    }

    fn request_stop(&self, id: ProcessId) -> Result<Pending, HostError> {
        let (reply, pending) = oneshot::channel();
        self.send(HostMessage::Stop { id, reply })?;
        Ok(pending)
    }

    /// Returns a handle to the process registered under `id`.
    ///
    /// With a configuration the process is created, replacing any previous
    /// definition (a live predecessor is stopped first). Without one, `id`
    /// must already be registered.
    pub async fn create(
        &self,
        id: impl Into<ProcessId>,
        config: Option<ProcessConfig>,
    ) -> Result<ManagedProcessHandle, HostError> {
        let id = id.into();
        match config {
            Some(config) => settled(self.request_create(id.clone(), config)?).await?,
            None => {
                if id.is_empty() {
                    return Err(HostError::MissingIdentifier);
                }
                if self.snapshot(&id).await?.is_none() {
                    return Err(HostError::UnknownProcess(id));
                }
            }
        }
        Ok(self.process(id))
    }

    /// Starts the process registered under `id`, resolving once it reports `started`.
    ///
    /// A configuration creates the process if needed. Supplying one for a
    /// process that is already running redefines it: the current instance is
    /// stopped and released before the new one is started, so at most one OS
    /// process exists per id at any time.
    pub async fn start(
        &self,
        id: impl Into<ProcessId>,
        config: Option<ProcessConfig>,
    ) -> Result<ManagedProcessHandle, HostError> {
        let id = id.into();
        settled(self.request_start(id.clone(), config)?).await?;
        Ok(self.process(id))
    }

    /// Stops one process, or every registered process when `id` is `None`,
    /// resolving once all of them report `stopped`.
    pub async fn stop(&self, id: Option<&str>) -> Result<(), HostError> {
        let ids = match id {
            Some(id) => vec![id.to_string()],
            None => self.processes().await?,
        };
        let pending = ids
            .into_iter()
            .map(|id| self.request_stop(id))
            .collect::<Result<Vec<_>, _>>()?;
        wait_all(pending).await
    }

    /// Re-issues `start` on one process, or on every registered process when
    /// `id` is `None`, resolving once all of them report `started`.
    pub async fn restart(&self, id: Option<&str>) -> Result<(), HostError> {
        let ids = match id {
            Some(id) => vec![id.to_string()],
            None => self.processes().await?,
        };
        let pending = ids
            .into_iter()
            .map(|id| self.request_start(id, None))
            .collect::<Result<Vec<_>, _>>()?;
        wait_all(pending).await.map_err(|err| match err {
            HostError::UnknownProcess(id) => HostError::NotFound(id),
            err => err,
        })
    }

    /// Creates every process in `configs`, starting those flagged with `start`.
    ///
    /// Resolves once every entry has settled; the first error is returned.
    pub async fn setup<K, I>(
        &self,
        configs: I,
    ) -> Result<BTreeMap<ProcessId, ManagedProcessHandle>, HostError>
    where
        K: Into<ProcessId>,
        I: IntoIterator<Item = (K, ProcessConfig)>,
    {
        let mut ids = Vec::new();
        let mut pending = Vec::new();
        for (id, config) in configs {
            let id = id.into();
            let request = if config.start {
                self.request_start(id.clone(), Some(config))?
            } else {
                self.request_create(id.clone(), config)?
            };
            ids.push(id);
            pending.push(request);
        }
        wait_all(pending).await?;
        Ok(ids
            .into_iter()
            .map(|id| (id.clone(), self.process(id)))
            .collect())
    }

    /// Registered process ids, sorted.
    pub async fn processes(&self) -> Result<Vec<ProcessId>, HostError> {
        let mut ids = self
            .snapshots()
            .await?
            .into_iter()
            .map(|snapshot| snapshot.id)
            .collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    pub async fn snapshot(&self, id: &str) -> Result<Option<ProcessSnapshot>, HostError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::Snapshot {
            id: id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| HostError::HostClosed)
    }

    pub async fn snapshots(&self) -> Result<Vec<ProcessSnapshot>, HostError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::SnapshotAll { reply })?;
        rx.await.map_err(|_| HostError::HostClosed)
    }

    pub async fn get_process_status(&self, id: &str) -> Result<Option<ProcessState>, HostError> {
        Ok(self.snapshot(id).await?.map(|snapshot| snapshot.state))
    }

    pub async fn get_all_process_statuses(
        &self,
    ) -> Result<HashMap<ProcessId, ProcessState>, HostError> {
        Ok(self
            .snapshots()
            .await?
            .into_iter()
            .map(|snapshot| (snapshot.id, snapshot.state))
            .collect())
    }

    /// A handle to `id`. Operations on it fail if nothing is registered there.
    pub fn process(&self, id: impl Into<ProcessId>) -> ManagedProcessHandle {
        ManagedProcessHandle {
            id: id.into(),
            host: self.clone(),
        }
    }

    /// Events raised from now on that match `filter`.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription::new(self.events.subscribe(), filter)
    }

    /// Stops every process and ends the supervision loop once they have stopped.
    pub async fn shutdown(&self) -> Result<(), HostError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::Shutdown { reply })?;
        rx.await.map_err(|_| HostError::HostClosed)
    }

    /// Waits for the supervision loop to end.
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }
}

async fn wait_all(pending: Vec<Pending>) -> Result<(), HostError> {
    let mut first_error = None;
    for pending in pending {
        if let Err(err) = settled(pending).await {
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// A reference to one managed process inside a running host.
#[derive(Debug, Clone)]
pub struct ManagedProcessHandle {
    id: ProcessId,
    host: ProcessHostHandle,
}

impl ManagedProcessHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts the process, resolving once it reports `started`.
    ///
    /// On a started process this restarts it when `restart` is enabled and
    /// simply re-affirms `started` otherwise.
    pub async fn start(&self) -> Result<Self, HostError> {
        settled(self.host.request_start(self.id.clone(), None)?).await?;
        Ok(self.clone())
    }

    /// Stops the process, resolving once it reports `stopped`.
    pub async fn stop(&self) -> Result<(), HostError> {
        settled(self.host.request_stop(self.id.clone())?).await
    }

    /// Writes to the process's stdin. Dropped silently when no piped child is live.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), HostError> {
        self.host.send(HostMessage::Write {
            id: self.id.clone(),
            data: data.into(),
        })
    }

    /// Detaches the process's watchers and releases its handle. Only safe once
    /// the process has stopped or failed.
    pub async fn cleanup(&self) -> Result<(), HostError> {
        let (reply, pending) = oneshot::channel();
        self.host.send(HostMessage::Cleanup {
            id: self.id.clone(),
            reply,
        })?;
        settled(pending).await
    }

    pub async fn snapshot(&self) -> Result<ProcessSnapshot, HostError> {
        self.host
            .snapshot(&self.id)
            .await?
            .ok_or_else(|| HostError::NotFound(self.id.clone()))
    }

    pub async fn state(&self) -> Result<ProcessState, HostError> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn exits(&self) -> Result<u32, HostError> {
        Ok(self.snapshot().await?.exits)
    }

    /// Events raised by this process from now on.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_to(EventFilter::all())
    }

    pub fn subscribe_to(&self, filter: EventFilter) -> Subscription {
        self.host.subscribe(filter.process(self.id.clone()))
    }
}
