// codecall CLI
//
// Design Decision: Use clap derive for argument parsing; every flag can also come from the environment.
// Design Decision: Calls go through a real CodeCallerService so the CLI exercises the same pool as servers.
// Design Decision: Logs go to stderr at warn by default so stdout stays machine-readable.

mod commands;
mod output;

use std::time::Duration;

use clap::{Parser, Subcommand};
use codecall::telemetry::{init_tracing, TracingConfig};
use codecall::{Config, ExecutionMode};

#[derive(Parser)]
#[command(name = "codecall")]
#[command(about = "Run course code through codecall workers")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    /// Number of pooled workers (overrides CODECALL_WORKERS_COUNT)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Isolation mode: native, container or disabled
    #[arg(long, env = "CODECALL_EXECUTION_MODE")]
    pub mode: Option<ExecutionMode>,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Built-in code tree (python/, elements/)
    #[arg(long, env = "CODECALL_BUILTIN_ROOT")]
    pub builtin_root: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Call a function in question or element code
    Call(commands::call::CallArgs),

    /// Start workers and check that they answer
    Ping(commands::ping::PingArgs),
}

impl Cli {
    /// Environment configuration with command-line overrides applied
    fn config(&self) -> Config {
        let mut config = Config::from_env();
        if let Some(workers) = self.workers {
            config = config.with_workers_count(workers);
        }
        if let Some(mode) = self.mode {
            config = config.with_execution_mode(mode);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_question_timeout(Duration::from_millis(ms));
        }
        if let Some(root) = &self.builtin_root {
            config = config.with_builtin_root(root);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut tracing_config = TracingConfig::from_env("codecall-cli");
    if tracing_config.log_filter.is_none() {
        tracing_config.log_filter = Some("warn".to_string());
    }
    init_tracing(tracing_config);

    let cli = Cli::parse();
    let config = cli.config();
    let output_format = output::OutputFormat::parse(&cli.output);

    match cli.command {
        Commands::Call(args) => commands::call::run(args, config, output_format, cli.quiet).await,
        Commands::Ping(args) => commands::ping::run(args, config, output_format).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codecall::CallType;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "codecall",
            "--output",
            "json",
            "--workers",
            "2",
            "call",
            "--course",
            "/courses/demo",
            "--directory",
            "addNumbers",
            "--file",
            "server",
            "--function",
            "generate",
            "--args",
            "[7]",
            "--repeat",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.workers, Some(2));
        assert_eq!(cli.config().workers_count, Some(2));
        let Commands::Call(args) = cli.command else {
            panic!("expected call command");
        };
        assert_eq!(args.call_type, CallType::Question);
        assert_eq!(args.repeat, 4);
        assert_eq!(args.concurrency, 1);
        assert_eq!(args.args, "[7]");
    }

    #[test]
    fn test_parse_mode_and_timeout() {
        let cli = Cli::try_parse_from([
            "codecall",
            "--mode",
            "disabled",
            "--timeout-ms",
            "250",
            "ping",
        ])
        .unwrap();
        let config = cli.config();
        assert_eq!(config.execution_mode, ExecutionMode::Disabled);
        assert_eq!(config.question_timeout, Duration::from_millis(250));
    }
}
