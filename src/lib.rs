//! # process-host
//!
//! `process-host` keeps child OS processes alive from inside a Tokio application.
//! Each process is driven by its own lifecycle state machine: it is spawned,
//! watched, restarted after a crash (within a configurable budget), and stopped
//! on request. A host owns the whole fleet and republishes every lifecycle and
//! output event tagged with the process id.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use process_host::{EventFilter, EventKind, ProcessConfig, ProcessHostBuilder, StdioMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = ProcessHostBuilder::default().build().run();
//!
//!     let mut output = host.subscribe(EventFilter::all().kind(EventKind::Stdout));
//!     host.start(
//!         "ticker",
//!         Some(
//!             ProcessConfig::new("sh")
//!                 .with_args(["-c", "while true; do echo tick; sleep 1; done"])
//!                 .with_stdio(StdioMode::Pipe)
//!                 .with_restart_limit(3),
//!         ),
//!     )
//!     .await?;
//!
//!     if let Some(event) = output.recv().await {
//!         println!("{}: {:?}", event.topic(), event.output());
//!     }
//!
//!     host.stop(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## What you get
//!
//! * **Crash recovery**: an unexpected exit is restarted automatically until
//!   `restartLimit` crashes have been counted inside `restartWindow`.
//! * **Serialized lifecycle**: `start`/`stop` issued mid-transition are deferred
//!   and applied exactly once after the process settles.
//! * **Safe redefinition**: starting a running process with a new configuration
//!   stops the old OS process before the new one is spawned.
//! * **Aggregated events**: subscribe to one process, one kind of event, or all.
//!
//! ## API overview
//!
//! | ProcessHostHandle method       | Purpose                                                  |
//! | ------------------------------ | -------------------------------------------------------- |
//! | `create(id, config)`           | Register (or replace) a process without starting it      |
//! | `start(id, config)`            | Start, restart, or redefine a process                    |
//! | `stop(id)` / `restart(id)`     | Stop or restart one process, or all with `None`          |
//! | `setup(configs)`               | Bulk create/start from an id → configuration map         |
//! | `subscribe(filter)`            | Receive `ProcessEvent`s matching an `EventFilter`        |
//! | `install_shutdown_handlers()`  | Stop everything and exit on SIGINT/SIGTERM               |

pub use event::{EventFilter, EventKind, EventPayload, ProcessEvent, Subscription};
pub use host::{
    builder::ProcessHostBuilder,
    handle::{HostError, ManagedProcessHandle, ProcessHostHandle},
    shutdown::{ExitHook, ShutdownGuard},
    ProcessHost,
};
pub use process::{
    config::{ConfigError, ProcessConfig},
    ProcessSnapshot, ProcessState,
};
pub use spawn::{
    BoxedReader, BoxedWriter, CommandSpawner, ExitFuture, ExitInfo, ProcessControl, SpawnSpec,
    SpawnedProcess, Spawner, StdioMode,
};

mod event;
mod host;
mod process;
mod spawn;

pub type ProcessId = String;
