use std::time::Duration;

use anyhow::{Context, Result};
use codecall::backend::{spawn_child, NativeCommand};
use codecall::telemetry::{init_tracing, TracingConfig};
use codecall::Config;
use tokio::io::BufReader;

mod relay;

/// How long the zygote gets to exit on its own once stdin closes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Stderr is collected by the container runtime, not a terminal
    let mut tracing_config = TracingConfig::from_env("codecall-executor");
    tracing_config.ansi = false;
    init_tracing(tracing_config);

    let config = Config::from_env();
    let command = NativeCommand::python_zygote(&config);
    tracing::info!(
        program = %command.program().display(),
        zygote = %config.zygote_path().display(),
        "codecall-executor starting"
    );

    let spawned = spawn_child(&command).context("Failed to start zygote")?;
    let stdin = BufReader::new(tokio::io::stdin());
    let code = relay::run(stdin, tokio::io::stdout(), spawned, SHUTDOWN_GRACE)
        .await
        .context("Relay failed")?;

    tracing::info!(code, "Zygote exited, shutting down");
    std::process::exit(code);
}
