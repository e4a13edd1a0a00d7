// Call command: run one call, optionally repeated and in parallel

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Args;
use codecall::{
    CallRequest, CallType, CodeCallerService, Config, PoolMetrics, PrepareForCourse,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::output::{print_field, OutputFormat};

#[derive(Args)]
pub struct CallArgs {
    /// Course checkout directory
    #[arg(long, env = "CODECALL_COURSE")]
    pub course: PathBuf,

    /// Call type: question, course-element or core-element
    #[arg(long = "type", default_value = "question")]
    pub call_type: CallType,

    /// Question or element directory
    #[arg(long, short)]
    pub directory: Option<String>,

    /// Module to load, without extension
    #[arg(long, short, default_value = "server")]
    pub file: String,

    /// Function to call
    #[arg(long = "function", short = 'F')]
    pub function: String,

    /// Arguments as a JSON array
    #[arg(long, default_value = "[]")]
    pub args: String,

    /// Python modules the call may not import (repeatable)
    #[arg(long)]
    pub forbid: Vec<String>,

    /// Number of times to issue the call
    #[arg(long, default_value = "1")]
    pub repeat: usize,

    /// Calls in flight at once
    #[arg(long, default_value = "1")]
    pub concurrency: usize,
}

/// Outcome of one call
#[derive(Debug, Serialize)]
struct CallRecord {
    index: usize,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CallReport {
    calls: Vec<CallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool: Option<PoolMetrics>,
}

pub async fn run(args: CallArgs, config: Config, output: OutputFormat, quiet: bool) -> Result<()> {
    let call_args: Vec<Value> =
        serde_json::from_str(&args.args).context("--args must be a JSON array")?;
    let course = args
        .course
        .canonicalize()
        .with_context(|| format!("Course directory not found: {}", args.course.display()))?;

    let mut request = CallRequest::new(args.call_type, args.file, args.function).with_args(call_args);
    request.directory = args.directory;
    let prepare = PrepareForCourse::new(course).with_forbidden_modules(args.forbid);

    let mut service = CodeCallerService::new(config).context("Invalid configuration")?;
    service.init().await.context("Failed to start workers")?;

    let mut calls: Vec<CallRecord> = stream::iter(0..args.repeat.max(1))
        .map(|index| call_once(&service, index, prepare.clone(), request.clone()))
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;
    calls.sort_by_key(|record| record.index);

    let report = CallReport {
        calls,
        pool: service.metrics(),
    };
    service.finish().await;

    if output.is_text() {
        print_text(&report, quiet);
    } else {
        output.print_value(&report)?;
    }

    let failed = report.calls.iter().filter(|c| c.error.is_some()).count();
    if failed > 0 {
        bail!("{failed} of {} calls failed", report.calls.len());
    }
    Ok(())
}

async fn call_once(
    service: &CodeCallerService,
    index: usize,
    prepare: PrepareForCourse,
    request: CallRequest,
) -> CallRecord {
    let started = Instant::now();
    let result = service
        .with_worker(prepare, move |worker| {
            Box::pin(async move { worker.call(request).await })
        })
        .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(result) => CallRecord {
            index,
            elapsed_ms,
            data: Some(result.data),
            output: result.output,
            error: None,
        },
        Err(e) => {
            tracing::debug!(index, error = %e, "Call failed");
            CallRecord {
                index,
                elapsed_ms,
                data: None,
                output: String::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

fn print_text(report: &CallReport, quiet: bool) {
    for call in &report.calls {
        if !quiet {
            println!("Call {} ({} ms)", call.index + 1, call.elapsed_ms);
        }
        match (&call.data, &call.error) {
            (_, Some(error)) => print_field("Error", error),
            (Some(data), None) => print_field("Data", &data.to_string()),
            (None, None) => {}
        }
        if !quiet && !call.output.is_empty() {
            print_field("Output", call.output.trim_end());
        }
    }

    if let (false, Some(pool)) = (quiet, &report.pool) {
        println!();
        print_field(
            "Pool",
            &format!(
                "{} workers, {} created, {} replaced",
                pool.size, pool.created_total, pool.destroyed_total
            ),
        );
    }
}
