//! Transition table and entry actions of [`ManagedProcess`].
//!
//! Every input runs to completion before the next one is taken from
//! `pending`. Follow-up inputs produced by a step (a successful spawn, the
//! retry after a crash, replayed deferred commands) are queued behind it.

use tracing::{debug, info, warn};

use super::{Completion, MachineContext, ManagedProcess, OutputStream, ProcessSignal, ProcessState};
use crate::{
    event::{EventKind, EventPayload, ProcessEvent},
    host::HostError,
    spawn::ExitInfo,
};

#[derive(Debug)]
pub(super) enum Input {
    Start,
    /// A start deferred while another start was in flight. Once `started`
    /// is reached it only re-affirms the state instead of restarting again.
    Reaffirm,
    Stop,
    Spawned,
    ProcessExit(ExitInfo),
    SpawnFailed(String),
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Start,
    Stop,
}

/// A command parked until the machine enters `until`.
#[derive(Debug)]
pub(super) struct Deferred {
    until: ProcessState,
    command: Command,
}

impl ManagedProcess {
    /// Requests a start. Every waiter resolves on the next `started` or fails
    /// with [`HostError::RestartLimitExceeded`].
    /// A detached process rejects every start with [`HostError::Detached`].
    pub(crate) fn start(&mut self, ctx: &MachineContext, waiters: Vec<Completion>) {
        if self.is_detached() {
            debug!(process = %self.id, "refusing to start a cleaned up process");
            for waiter in waiters {
                let _ = waiter.send(Err(HostError::Detached(self.id.clone())));
            }
            return;
        }
        self.start_waiters.extend(waiters);
        self.dispatch(ctx, Input::Start);
    }

    /// Requests a stop. The waiter resolves on `stopped`, or at once when
    /// nothing is running.
    pub(crate) fn stop(&mut self, ctx: &MachineContext, waiter: Option<Completion>) {
        if self.is_settled() {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(()));
            }
            return;
        }
        self.stop_waiters.extend(waiter);
        self.dispatch(ctx, Input::Stop);
    }

    pub(crate) fn handle_signal(&mut self, ctx: &MachineContext, signal: ProcessSignal) {
        match signal {
            ProcessSignal::Exited {
                generation, info, ..
            } => {
                let current = self
                    .child
                    .as_ref()
                    .is_some_and(|child| child.generation == generation);
                if current {
                    debug!(process = %self.id, %info, "process exited");
                    self.dispatch(ctx, Input::ProcessExit(info));
                } else {
                    debug!(process = %self.id, generation, "ignoring exit of a previous spawn");
                }
            }
            ProcessSignal::SpawnFailed {
                generation, reason, ..
            } => {
                if generation == self.generation && self.child.is_none() {
                    self.dispatch(ctx, Input::SpawnFailed(reason));
                }
            }
            ProcessSignal::Output { stream, data, .. } => {
                let kind = match stream {
                    OutputStream::Stdout => EventKind::Stdout,
                    OutputStream::Stderr => EventKind::Stderr,
                };
                self.emit(ctx, kind, EventPayload::Output(data));
            }
            ProcessSignal::DecayExit { .. } => {
                self.exits = self.exits.saturating_sub(1);
                debug!(process = %self.id, exits = self.exits, "crash left the restart window");
            }
        }
    }

    fn dispatch(&mut self, ctx: &MachineContext, input: Input) {
        self.pending.push_back(input);
        while let Some(input) = self.pending.pop_front() {
            self.step(ctx, input);
        }
    }

    fn step(&mut self, ctx: &MachineContext, input: Input) {
        use ProcessState::*;

        match (self.state, input) {
            (Uninitialized | Stopped, Input::Start | Input::Reaffirm) => {
                self.exits = 0;
                self.transition(ctx, Starting);
                self.spawn(ctx);
            }
            (Starting | Restarting, Input::Start | Input::Reaffirm) => {
                self.defer(Started, Command::Start)
            }
            // The last spawn failed and its retry is still queued: nothing runs yet.
            (Starting | Restarting, Input::Stop) if self.child.is_none() => self.abandon(ctx),
            (Starting | Restarting, Input::Stop) => self.defer(Started, Command::Stop),
            (Starting | Restarting, Input::Spawned) => self.transition(ctx, Started),
            (Starting | Started, Input::ProcessExit(info)) => {
                self.release(ctx, info);
                self.transition(ctx, Crashed);
            }
            (Restarting, Input::ProcessExit(info)) => {
                self.release(ctx, info);
                self.spawn(ctx);
            }
            (Starting | Restarting, Input::SpawnFailed(reason)) => {
                warn!(process = %self.id, %reason, "failed to spawn process");
                self.transition(ctx, Crashed);
            }
            (Started, Input::Start) if self.config.restart => {
                info!(process = %self.id, "restarting process");
                self.transition(ctx, Restarting);
                self.kill();
            }
            (Started, Input::Start | Input::Reaffirm) => self.reaffirm(ctx),
            (Started, Input::Stop) => self.transition(ctx, Stopping),
            (Crashed, Input::Start | Input::Reaffirm) => {
                self.failed = false;
                self.transition(ctx, Restarting);
                self.spawn(ctx);
            }
            (Stopping, Input::ProcessExit(info)) => {
                self.release(ctx, info);
                self.transition(ctx, Stopped);
            }
            (Stopping, Input::Start | Input::Reaffirm) => self.defer(Stopped, Command::Start),
            (state, input) => {
                debug!(process = %self.id, %state, ?input, "input has no effect");
            }
        }
    }

    fn transition(&mut self, ctx: &MachineContext, next: ProcessState) {
        self.previous_state = self.state;
        self.state = next;
        debug!(process = %self.id, from = %self.previous_state, to = %next, "process entering state");

        if let Some(kind) = entry_event(next) {
            self.emit(ctx, kind, EventPayload::None);
        }
        match next {
            ProcessState::Started => {
                resolve(&mut self.start_waiters);
                self.replay(ProcessState::Started);
            }
            ProcessState::Stopping => self.kill(),
            ProcessState::Stopped => {
                resolve(&mut self.stop_waiters);
                self.replay(ProcessState::Stopped);
            }
            ProcessState::Crashed => self.count_crash(ctx),
            _ => {}
        }
    }

    /// Entry action of `crashed`: account for the crash and either retry or give up.
    fn count_crash(&mut self, ctx: &MachineContext) {
        if let Some(window) = self.config.restart_window() {
            self.exits = self.exits.saturating_add(1);
            let signals = ctx.signals.clone();
            let token = self.token.clone();
            let (id, instance) = (self.id.clone(), self.instance);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(window) => {
                        let _ = signals.send(ProcessSignal::DecayExit { id, instance });
                    }
                }
            });
        }
        debug!(
            process = %self.id,
            exits = self.exits,
            restart_limit = ?self.config.restart_limit,
            restart_window = ?self.config.restart_window(),
            "process crashed in state {}", self.previous_state
        );

        let within_limit = self
            .config
            .restart_limit
            .map_or(true, |limit| self.exits <= limit);
        if within_limit {
            self.pending.push_back(Input::Start);
        } else {
            self.fail(ctx);
        }
    }

    fn fail(&mut self, ctx: &MachineContext) {
        warn!(process = %self.id, exits = self.exits, "restart limit exceeded, giving up");
        self.failed = true;
        self.deferred.clear();
        self.emit(ctx, EventKind::Failed, EventPayload::None);
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(HostError::RestartLimitExceeded(self.id.clone())));
        }
        resolve(&mut self.stop_waiters);
    }

    /// Gives up on a start that has not produced a child and settles in `stopped`.
    fn abandon(&mut self, ctx: &MachineContext) {
        info!(process = %self.id, "stopped before a spawn succeeded");
        self.deferred.clear();
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(HostError::Cancelled(self.id.clone())));
        }
        self.transition(ctx, ProcessState::Stopped);
    }

    fn reaffirm(&mut self, ctx: &MachineContext) {
        self.emit(ctx, EventKind::Started, EventPayload::None);
        resolve(&mut self.start_waiters);
    }

    fn defer(&mut self, until: ProcessState, command: Command) {
        debug!(process = %self.id, ?command, %until, "deferring command");
        self.deferred.push_back(Deferred { until, command });
    }

    /// Queues every command deferred until `state`, in arrival order.
    fn replay(&mut self, state: ProcessState) {
        let mut ready = Vec::new();
        self.deferred.retain(|deferred| {
            if deferred.until == state {
                ready.push(deferred.command);
                false
            } else {
                true
            }
        });
        for command in ready {
            let input = match command {
                Command::Start if state == ProcessState::Started => Input::Reaffirm,
                Command::Start => Input::Start,
                Command::Stop => Input::Stop,
            };
            self.pending.push_back(input);
        }
    }

    fn spawn(&mut self, ctx: &MachineContext) {
        self.generation += 1;
        let generation = self.generation;
        debug!(process = %self.id, command = %self.config.command, generation, "spawning process");
        match ctx.spawner.spawn(&self.config.spawn_spec()) {
            Ok(spawned) => {
                self.attach(ctx, spawned, generation);
                self.pending.push_back(Input::Spawned);
            }
            Err(err) => {
                // Reported through the signal queue so a process that can never
                // spawn does not monopolise the host loop.
                let _ = ctx.signals.send(ProcessSignal::SpawnFailed {
                    id: self.id.clone(),
                    instance: self.instance,
                    generation,
                    reason: format!("{err:#}"),
                });
            }
        }
    }

    /// Drops the exited child and reports how it ended.
    fn release(&mut self, ctx: &MachineContext, info: ExitInfo) {
        self.child = None;
        self.emit(ctx, EventKind::Exited, EventPayload::Exit(info));
    }

    fn kill(&self) {
        let Some(child) = &self.child else {
            return;
        };
        for signal in self.config.kill_signals() {
            if let Err(err) = child.control.kill(signal) {
                warn!(process = %self.id, signal, error = ?err, "failed to signal process");
            }
        }
    }

    fn emit(&self, ctx: &MachineContext, kind: EventKind, payload: EventPayload) {
        let _ = ctx.events.send(ProcessEvent::new(&self.id, kind, payload));
    }
}

fn entry_event(state: ProcessState) -> Option<EventKind> {
    match state {
        ProcessState::Uninitialized => None,
        ProcessState::Starting => Some(EventKind::Starting),
        ProcessState::Started => Some(EventKind::Started),
        ProcessState::Restarting => Some(EventKind::Restarting),
        ProcessState::Stopping => Some(EventKind::Stopping),
        ProcessState::Stopped => Some(EventKind::Stopped),
        ProcessState::Crashed => Some(EventKind::Crashed),
    }
}

fn resolve(waiters: &mut Vec<Completion>) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(Ok(()));
    }
}
