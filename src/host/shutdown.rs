//! Orderly shutdown when the hosting process is asked to terminate.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ProcessHostHandle;

/// Terminates the hosting process with the given exit code.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

struct ShutdownState {
    fired: AtomicBool,
    host: ProcessHostHandle,
    exit: ExitHook,
    listeners: CancellationToken,
}

impl ShutdownState {
    async fn fire(&self, code: i32) {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!(code, "shutdown already in progress");
            return;
        }
        info!(code, "termination requested, stopping every managed process");
        if let Err(err) = self.host.stop(None).await {
            warn!(error = %err, "failed to stop processes during shutdown");
        }
        self.listeners.cancel();
        (self.exit)(code);
    }
}

/// Installed termination handlers. Only the first trigger has any effect.
///
/// Dropping the guard leaves the handlers installed; call
/// [`remove_listeners`](Self::remove_listeners) to detach them.
#[derive(Clone)]
pub struct ShutdownGuard {
    state: Arc<ShutdownState>,
}

impl ShutdownGuard {
    /// Runs the shutdown sequence as if the hosting process were exiting with
    /// `code` (0 when `None`).
    pub async fn trigger(&self, code: Option<i32>) {
        self.state.fire(code.unwrap_or(0)).await;
    }

    /// Detaches the shutdown sequence from SIGINT/SIGTERM without shutting
    /// anything down.
    ///
    /// The runtime keeps its handlers registered for the rest of the process,
    /// so a later signal no longer stops the managed processes but still
    /// terminates through the exit hook with the conventional `128 + signo`
    /// status, as the default disposition would.
    pub fn remove_listeners(&self) {
        self.state.listeners.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        !self.state.listeners.is_cancelled()
    }
}

impl ProcessHostHandle {
    /// Stops every process and exits the hosting process on SIGINT or SIGTERM.
    pub fn install_shutdown_handlers(&self) -> io::Result<ShutdownGuard> {
        self.install_shutdown_handlers_with(Arc::new(exit_process))
    }

    /// Like [`install_shutdown_handlers`](Self::install_shutdown_handlers), with
    /// a custom way to terminate once every process has stopped.
    pub fn install_shutdown_handlers_with(&self, exit: ExitHook) -> io::Result<ShutdownGuard> {
        let state = Arc::new(ShutdownState {
            fired: AtomicBool::new(false),
            host: self.clone(),
            exit,
            listeners: CancellationToken::new(),
        });

        let mut signals = TerminationSignals::new()?;
        let listener = state.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = listener.listeners.cancelled() => {}
                _ = signals.recv() => listener.fire(0).await,
            }
            // Handlers cannot be unregistered; fall back to terminating.
            let code = signals.recv().await;
            debug!(code, "termination signal after listeners were removed");
            (listener.exit)(code);
        });

        Ok(ShutdownGuard { state })
    }
}

fn exit_process(code: i32) {
    std::process::exit(code)
}

#[cfg(unix)]
struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next signal and returns the exit status its default
    /// disposition would produce.
    async fn recv(&mut self) -> i32 {
        use nix::sys::signal::Signal;

        let signal = tokio::select! {
            _ = self.interrupt.recv() => Signal::SIGINT,
            _ = self.terminate.recv() => Signal::SIGTERM,
        };
        128 + signal as i32
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> i32 {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        130
    }
}
