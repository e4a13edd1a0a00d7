// Tracing setup shared by the codecall binaries
//
// Logs go to stderr: the executor relay owns stdout for envelopes.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "codecall=debug")
    pub log_filter: Option<String>,
    /// Emit ANSI colours
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "codecall".to_string(),
            log_filter: None,
            ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `NO_COLOR`: disable ANSI colours when set
    pub fn from_env(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ansi: std::env::var_os("NO_COLOR").is_none(),
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber
///
/// Returns false when a subscriber was already installed (tests, embedding
/// applications); the existing one is left in place.
pub fn init_tracing(config: TracingConfig) -> bool {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(true)
        .with_filter(config.filter());

    let installed = tracing_subscriber::registry().with(layer).try_init().is_ok();
    if installed {
        tracing::debug!(service = %config.service_name, "Tracing initialized");
    }
    installed
}
