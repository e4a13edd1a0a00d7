// Ping command: start workers and confirm the zygote answers

use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Args;
use codecall::{Config, WorkerFactory};
use serde::Serialize;
use uuid::Uuid;

use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Args)]
pub struct PingArgs {
    /// Number of workers to start
    #[arg(long, short, default_value = "1")]
    pub count: usize,
}

#[derive(Debug, Serialize)]
struct PingRecord {
    worker_id: Uuid,
    backend: &'static str,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run(args: PingArgs, config: Config, output: OutputFormat) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let factory = WorkerFactory::from_config(&config)
        .await
        .context("Failed to set up execution backend")?;

    let pings = (0..args.count.max(1)).map(|_| async {
        let mut worker = factory.create();
        let started = Instant::now();
        let result = worker.ensure_child().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        worker.done().await;
        PingRecord {
            worker_id: worker.id(),
            backend: factory.backend(),
            elapsed_ms,
            error: result.err().map(|e| e.to_string()),
        }
    });
    let records = futures::future::join_all(pings).await;

    if output.is_text() {
        print_table_header(&[("WORKER", 36), ("BACKEND", 10), ("TIME", 8), ("RESULT", 40)]);
        for record in &records {
            let worker_id = record.worker_id.to_string();
            let time = format!("{} ms", record.elapsed_ms);
            print_table_row(&[
                (&worker_id, 36),
                (record.backend, 10),
                (&time, 8),
                (record.error.as_deref().unwrap_or("pong"), 40),
            ]);
        }
    } else {
        output.print_value(&records)?;
    }

    let failed = records.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        bail!("{failed} of {} workers failed to answer", records.len());
    }
    Ok(())
}
