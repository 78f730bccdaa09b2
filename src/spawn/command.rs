use std::process::{ExitStatus, Stdio};

use anyhow::Context;
use tokio::process::Command;
use tracing::{info, warn};

use super::{
    BoxedReader, BoxedWriter, ExitInfo, ProcessControl, SpawnSpec, SpawnedProcess, Spawner,
    StdioMode,
};

/// Launches children with `tokio::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

impl Spawner for CommandSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<SpawnedProcess> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(stdio(spec.stdio))
            .stdout(stdio(spec.stdio))
            .stderr(stdio(spec.stdio));
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", spec.command))?;

        let pid = child.id();
        info!(command = %spec.command, args = ?spec.args, ?pid, "spawned child process");

        let stdout = child.stdout.take().map(|s| Box::new(s) as BoxedReader);
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);
        let stdin = child.stdin.take().map(|s| Box::new(s) as BoxedWriter);

        let exit = Box::pin(async move {
            match child.wait().await {
                Ok(status) => exit_info(status),
                Err(err) => {
                    warn!(?pid, error = %err, "failed to wait on child process");
                    ExitInfo::default()
                }
            }
        });

        Ok(SpawnedProcess {
            control: Box::new(PidControl { pid }),
            stdout,
            stderr,
            stdin,
            exit,
        })
    }
}

fn stdio(mode: StdioMode) -> Stdio {
    match mode {
        StdioMode::Inherit => Stdio::inherit(),
        StdioMode::Pipe => Stdio::piped(),
        StdioMode::Null => Stdio::null(),
    }
}

#[cfg(unix)]
fn exit_info(status: ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;

    let signal = status
        .signal()
        .and_then(|raw| nix::sys::signal::Signal::try_from(raw).ok())
        .map(|signal| signal.as_str().to_string());
    ExitInfo {
        code: status.code(),
        signal,
    }
}

#[cfg(not(unix))]
fn exit_info(status: ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

/// Signals a child by pid. The child itself is owned by its exit future.
struct PidControl {
    pid: Option<u32>,
}

impl ProcessControl for PidControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn kill(&self, signal: &str) -> anyhow::Result<()> {
        use std::str::FromStr;

        use nix::{sys::signal::Signal, unistd::Pid};

        let pid = self
            .pid
            .context("child process has already been reaped")?;
        let signal =
            Signal::from_str(signal).with_context(|| format!("unknown signal `{signal}`"))?;
        nix::sys::signal::kill(Pid::from_raw(pid as i32), signal)
            .with_context(|| format!("failed to send {} to pid {pid}", signal.as_str()))
    }

    #[cfg(not(unix))]
    fn kill(&self, signal: &str) -> anyhow::Result<()> {
        anyhow::bail!("cannot deliver {signal}: signals are only supported on unix")
    }
}
