use std::time::Duration;

use process_host::{
    EventFilter, EventKind, ProcessConfig, ProcessHostBuilder, StdioMode,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("process_host=debug")),
        )
        .init();

    // A ticker that runs until stopped, and a worker that crashes every two seconds
    let host = ProcessHostBuilder::default()
        .with_process(
            "ticker",
            ProcessConfig::new("sh")
                .with_args(["-c", "while true; do echo tick; sleep 1; done"])
                .with_stdio(StdioMode::Pipe)
                .with_start(true),
        )
        .with_process(
            "flaky",
            ProcessConfig::new("sh")
                .with_args(["-c", "echo working; sleep 2; exit 1"])
                .with_stdio(StdioMode::Pipe)
                .with_restart_limit(3)
                .with_restart_window(Duration::from_secs(30))
                .with_start(true),
        )
        .build()
        .run();

    // Stop everything on Ctrl-C
    let _guard = host.install_shutdown_handlers()?;

    let mut events = host.subscribe(EventFilter::all());
    while let Some(event) = events.recv().await {
        match event.kind {
            EventKind::Stdout | EventKind::Stderr => {
                print!("[{}] {}", event.process_id, event.output().unwrap_or_default());
            }
            EventKind::Exited => {
                if let Some(info) = event.exit_info() {
                    println!("{} exited with {info}", event.process_id);
                }
            }
            EventKind::Failed => {
                println!("{} gave up, stopping the host", event.process_id);
                break;
            }
            _ => println!("{}", event.topic()),
        }
    }

    host.shutdown().await?;
    host.wait().await;
    println!("All processes stopped!");
    Ok(())
}
