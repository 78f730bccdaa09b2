//! The OS boundary: how a child process is launched and observed.
//!
//! The host never spawns processes itself. It asks a [`Spawner`] to launch a
//! [`SpawnSpec`] and receives a [`SpawnedProcess`]: optional stdio streams, a
//! [`ProcessControl`] to deliver signals, and a future that resolves once the
//! child has exited. [`CommandSpawner`] is the `tokio::process` implementation;
//! tests substitute their own.

mod command;

use std::{collections::HashMap, fmt, future::Future, path::PathBuf, pin::Pin};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub use command::CommandSpawner;

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Share the supervisor's own stdin/stdout/stderr.
    #[default]
    Inherit,
    /// Capture stdout/stderr as events and accept writes to stdin.
    Pipe,
    /// Discard everything.
    Null,
}

/// Everything a [`Spawner`] needs to launch one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    /// `None` runs the child in the supervisor's current directory.
    pub cwd: Option<PathBuf>,
    /// Applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub stdio: StdioMode,
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn with_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type ExitFuture = Pin<Box<dyn Future<Output = ExitInfo> + Send>>;

/// Signal delivery for a live child.
pub trait ProcessControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Sends the named signal (`"SIGTERM"`, `"SIGKILL"`, ...) to the child.
    fn kill(&self, signal: &str) -> anyhow::Result<()>;
}

/// A freshly launched child, handed over to its managed process.
pub struct SpawnedProcess {
    pub control: Box<dyn ProcessControl>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub stdin: Option<BoxedWriter>,
    /// Resolves exactly once, when the child exits.
    pub exit: ExitFuture,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.control.pid())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// The injected capability that launches OS processes.
///
/// `spawn` must not block: it launches the child and returns immediately.
/// An error is treated by the caller exactly like a crash.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<SpawnedProcess>;
}
