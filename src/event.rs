use std::fmt;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::{spawn::ExitInfo, ProcessId};

/// What happened to a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Starting,
    Started,
    Restarting,
    Stopping,
    Stopped,
    Crashed,
    /// The OS process ended, deliberately or not. Carries [`ExitInfo`].
    Exited,
    /// The restart budget is exhausted; no further automatic restarts.
    Failed,
    Stdout,
    Stderr,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Exited => "exited",
            Self::Failed => "failed",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    None,
    Exit(ExitInfo),
    /// A chunk of stdout/stderr, decoded lossily as UTF-8.
    Output(String),
}

/// An event raised by one managed process and republished by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub process_id: ProcessId,
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl ProcessEvent {
    pub(crate) fn new(process_id: &ProcessId, kind: EventKind, payload: EventPayload) -> Self {
        Self {
            process_id: process_id.clone(),
            kind,
            payload,
        }
    }

    /// The qualified topic, `"<id>.<event>"`.
    pub fn topic(&self) -> String {
        format!("{}.{}", self.process_id, self.kind)
    }

    pub fn exit_info(&self) -> Option<&ExitInfo> {
        match &self.payload {
            EventPayload::Exit(info) => Some(info),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Output(data) => Some(data),
            _ => None,
        }
    }
}

/// Selects which events a [`Subscription`] yields.
///
/// An empty filter matches everything. Restricting both the process and the
/// kinds yields only events satisfying both.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    process_id: Option<ProcessId>,
    kinds: Vec<EventKind>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Only events raised by `process_id`.
    pub fn process(mut self, process_id: impl Into<ProcessId>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    /// Only events of `kind`. May be called repeatedly to accept several kinds.
    pub fn kind(mut self, kind: EventKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    pub fn matches(&self, event: &ProcessEvent) -> bool {
        let process_matches = self
            .process_id
            .as_ref()
            .map_or(true, |id| *id == event.process_id);
        let kind_matches = self.kinds.is_empty() || self.kinds.contains(&event.kind);
        process_matches && kind_matches
    }
}

/// A filtered stream of [`ProcessEvent`]s.
///
/// Only events raised after the subscription was created are observed.
pub struct Subscription {
    rx: broadcast::Receiver<ProcessEvent>,
    filter: EventFilter,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<ProcessEvent>, filter: EventFilter) -> Self {
        Self { rx, filter }
    }

    /// Waits for the next matching event. Returns `None` once the host is gone.
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscription lagged behind process events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<ProcessEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscription lagged behind process events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
