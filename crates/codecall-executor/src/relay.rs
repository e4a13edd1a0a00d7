//! Stdio relay between the container runtime and the zygote
//!
//! Request lines read from `input` go to the zygote's stdin unchanged. Every
//! chunk the zygote writes on stdout, stderr, fd 3 or fd 4 comes back out
//! of `output` as one envelope line. When `input` reaches EOF the zygote's
//! stdin is closed; if it is still running after the grace period it is
//! signalled.

use std::time::Duration;

use anyhow::{Context, Result};
use codecall::backend::{ChildEvent, ExitInfo, Spawned};
use codecall_protocol::Envelope;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Relay until the zygote exits; returns the exit code to propagate
pub async fn run<I, O>(
    input: I,
    mut output: O,
    spawned: Spawned,
    shutdown_grace: Duration,
) -> Result<i32>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let Spawned {
        mut unit,
        mut events,
    } = spawned;
    let mut requests = input.lines();
    let mut input_open = true;
    let mut kill_at: Option<Instant> = None;

    loop {
        tokio::select! {
            line = requests.next_line(), if input_open => {
                match line {
                    Ok(Some(line)) => {
                        if let Err(e) = unit.send_line(&format!("{line}\n")).await {
                            warn!(error = %e, "Failed to forward request to zygote");
                        }
                    }
                    Ok(None) => {
                        debug!("Input closed, closing zygote stdin");
                        input_open = false;
                        unit.close_stdin().await;
                        kill_at = Some(Instant::now() + shutdown_grace);
                    }
                    Err(e) => {
                        unit.kill();
                        return Err(e).context("Failed to read request");
                    }
                }
            }
            _ = sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                warn!(child = %unit.describe(), "Zygote still running after input closed, signalling it");
                unit.kill();
                kill_at = Some(Instant::now() + shutdown_grace);
            }
            event = events.recv() => {
                match event {
                    Some(ChildEvent::Output { channel, text }) => {
                        let line = Envelope::new(channel, text).to_line()?;
                        output
                            .write_all(line.as_bytes())
                            .await
                            .context("Failed to write envelope")?;
                        output.flush().await?;
                    }
                    Some(ChildEvent::Malformed(line)) => {
                        warn!(%line, "Ignoring malformed zygote output");
                    }
                    Some(ChildEvent::Failed(message)) => {
                        warn!(%message, "Zygote stream failed");
                    }
                    Some(ChildEvent::Exited(info)) => {
                        output.flush().await?;
                        debug!(exit = %info, "Zygote exited");
                        return Ok(exit_code(info));
                    }
                    None => return Ok(exit_code(ExitInfo::default())),
                }
            }
        }
    }
}

/// Shell convention: the code itself, or 128 + signal number
fn exit_code(info: ExitInfo) -> i32 {
    match (info.code, info.signal) {
        (Some(code), _) => code as i32,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
