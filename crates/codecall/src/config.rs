//! Worker, pool and backend configuration
//!
//! Every field can be set from a `CODECALL_*` environment variable. Values
//! that fail to parse fall back to the default with a warning; cross-field
//! checks live in [`Config::validate`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How worker children are isolated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Zygote runs as a plain child process of this one
    #[default]
    Native,
    /// Zygote runs inside a Docker container via the executor relay
    Container,
    /// No pool; a fresh native worker per use, torn down afterwards
    Disabled,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Native => "native",
            ExecutionMode::Container => "container",
            ExecutionMode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(ExecutionMode::Native),
            "container" => Ok(ExecutionMode::Container),
            "disabled" => Ok(ExecutionMode::Disabled),
            other => Err(ConfigError::UnknownExecutionMode(other.to_string())),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown execution mode: {0} (expected native, container or disabled)")]
    UnknownExecutionMode(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

const DEFAULT_EXECUTOR_IMAGE: &str = "codecall/executor";

/// Configuration for workers, the pool and the execution backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Fixed pool size; `None` derives it from the CPU count
    pub workers_count: Option<usize>,

    /// Workers per available CPU when `workers_count` is unset
    pub workers_per_cpu: f64,

    pub execution_mode: ExecutionMode,

    /// Wait FIFO for a worker (true) or fail after `overload_delay` (false)
    pub use_queue: bool,

    #[serde(with = "duration_millis")]
    pub overload_delay: Duration,

    /// Limit for a single user call
    #[serde(with = "duration_millis")]
    pub question_timeout: Duration,

    /// Limit for the warm-up ping after the child starts
    #[serde(with = "duration_millis")]
    pub ping_timeout: Duration,

    /// Limit for the zygote to confirm a restart on the restart channel
    #[serde(with = "duration_millis")]
    pub restart_timeout: Duration,

    /// Extra time granted to container calls for relay overhead
    #[serde(with = "duration_millis")]
    pub container_timeout_grace: Duration,

    /// Start every worker's child when the pool is created
    pub warm_up: bool,

    /// Ask the zygote to drop privileges before running course code
    pub drop_privileges: bool,

    /// Virtual environments searched for `bin/python3`, in order
    pub python_venv_search_paths: Vec<PathBuf>,

    /// Zygote script; defaults to `<builtin_root>/python/zygote.py`
    pub zygote_path: Option<PathBuf>,

    /// Root of the built-in code tree (`python/`, `elements/`)
    pub builtin_root: PathBuf,

    /// Built-in code tree as seen from inside the executor container
    pub container_builtin_root: PathBuf,

    /// Used verbatim when set (no registry prefix)
    pub executor_image_repository: Option<String>,

    pub executor_image_tag: String,

    /// Registry prepended to the default executor image
    pub cache_image_registry: Option<String>,

    /// Pull the executor image while building the factory rather than on first launch
    pub ensure_executor_image_at_startup: bool,

    pub container_pids_limit: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers_count: None,
            workers_per_cpu: 1.0,
            execution_mode: ExecutionMode::Native,
            use_queue: true,
            overload_delay: Duration::from_secs(10),
            question_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(60),
            restart_timeout: Duration::from_secs(1),
            container_timeout_grace: Duration::from_secs(5),
            warm_up: false,
            drop_privileges: false,
            python_venv_search_paths: vec![PathBuf::from(".venv")],
            zygote_path: None,
            builtin_root: PathBuf::from("."),
            container_builtin_root: PathBuf::from("/app"),
            executor_image_repository: None,
            executor_image_tag: "latest".to_string(),
            cache_image_registry: None,
            ensure_executor_image_at_startup: false,
            container_pids_limit: 64,
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `CODECALL_WORKERS_COUNT`, `CODECALL_WORKERS_PER_CPU`
    /// - `CODECALL_EXECUTION_MODE`: native, container or disabled
    /// - `CODECALL_USE_QUEUE`, `CODECALL_OVERLOAD_DELAY_MS`
    /// - `CODECALL_QUESTION_TIMEOUT_MS`, `CODECALL_PING_TIMEOUT_MS`,
    ///   `CODECALL_RESTART_TIMEOUT_MS`, `CODECALL_CONTAINER_TIMEOUT_GRACE_MS`
    /// - `CODECALL_WARM_UP`, `CODECALL_DROP_PRIVILEGES`
    /// - `CODECALL_PYTHON_VENV_SEARCH_PATHS`: colon-separated list
    /// - `CODECALL_ZYGOTE_PATH`, `CODECALL_BUILTIN_ROOT`, `CODECALL_CONTAINER_BUILTIN_ROOT`
    /// - `CODECALL_EXECUTOR_IMAGE_REPOSITORY`, `CODECALL_EXECUTOR_IMAGE_TAG`,
    ///   `CODECALL_CACHE_IMAGE_REGISTRY`, `CODECALL_ENSURE_EXECUTOR_IMAGE_AT_STARTUP`
    /// - `CODECALL_CONTAINER_PIDS_LIMIT`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source (used by `from_env` and tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let execution_mode = match get("CODECALL_EXECUTION_MODE").map(|v| v.parse()) {
            Some(Ok(mode)) => mode,
            Some(Err(e)) => {
                warn!(error = %e, "Ignoring CODECALL_EXECUTION_MODE");
                defaults.execution_mode
            }
            None => defaults.execution_mode,
        };

        Self {
            workers_count: parse_var(&get, "CODECALL_WORKERS_COUNT").or(defaults.workers_count),
            workers_per_cpu: parse_var(&get, "CODECALL_WORKERS_PER_CPU")
                .unwrap_or(defaults.workers_per_cpu),
            execution_mode,
            use_queue: parse_flag(&get, "CODECALL_USE_QUEUE").unwrap_or(defaults.use_queue),
            overload_delay: parse_millis(&get, "CODECALL_OVERLOAD_DELAY_MS")
                .unwrap_or(defaults.overload_delay),
            question_timeout: parse_millis(&get, "CODECALL_QUESTION_TIMEOUT_MS")
                .unwrap_or(defaults.question_timeout),
            ping_timeout: parse_millis(&get, "CODECALL_PING_TIMEOUT_MS")
                .unwrap_or(defaults.ping_timeout),
            restart_timeout: parse_millis(&get, "CODECALL_RESTART_TIMEOUT_MS")
                .unwrap_or(defaults.restart_timeout),
            container_timeout_grace: parse_millis(&get, "CODECALL_CONTAINER_TIMEOUT_GRACE_MS")
                .unwrap_or(defaults.container_timeout_grace),
            warm_up: parse_flag(&get, "CODECALL_WARM_UP").unwrap_or(defaults.warm_up),
            drop_privileges: parse_flag(&get, "CODECALL_DROP_PRIVILEGES")
                .unwrap_or(defaults.drop_privileges),
            python_venv_search_paths: get("CODECALL_PYTHON_VENV_SEARCH_PATHS")
                .map(|v| std::env::split_paths(&v).collect())
                .unwrap_or(defaults.python_venv_search_paths),
            zygote_path: get("CODECALL_ZYGOTE_PATH").map(PathBuf::from),
            builtin_root: get("CODECALL_BUILTIN_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.builtin_root),
            container_builtin_root: get("CODECALL_CONTAINER_BUILTIN_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.container_builtin_root),
            executor_image_repository: get("CODECALL_EXECUTOR_IMAGE_REPOSITORY"),
            executor_image_tag: get("CODECALL_EXECUTOR_IMAGE_TAG")
                .unwrap_or(defaults.executor_image_tag),
            cache_image_registry: get("CODECALL_CACHE_IMAGE_REGISTRY"),
            ensure_executor_image_at_startup: parse_flag(
                &get,
                "CODECALL_ENSURE_EXECUTOR_IMAGE_AT_STARTUP",
            )
            .unwrap_or(defaults.ensure_executor_image_at_startup),
            container_pids_limit: parse_var(&get, "CODECALL_CONTAINER_PIDS_LIMIT")
                .unwrap_or(defaults.container_pids_limit),
        }
    }

    /// Set a fixed pool size
    pub fn with_workers_count(mut self, count: usize) -> Self {
        self.workers_count = Some(count);
        self
    }

    pub fn with_workers_per_cpu(mut self, per_cpu: f64) -> Self {
        self.workers_per_cpu = per_cpu;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Queue for workers (true) or fail fast with `Overload` (false)
    pub fn with_use_queue(mut self, use_queue: bool) -> Self {
        self.use_queue = use_queue;
        self
    }

    pub fn with_overload_delay(mut self, delay: Duration) -> Self {
        self.overload_delay = delay;
        self
    }

    pub fn with_question_timeout(mut self, timeout: Duration) -> Self {
        self.question_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_restart_timeout(mut self, timeout: Duration) -> Self {
        self.restart_timeout = timeout;
        self
    }

    pub fn with_warm_up(mut self, warm_up: bool) -> Self {
        self.warm_up = warm_up;
        self
    }

    pub fn with_builtin_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.builtin_root = root.into();
        self
    }

    pub fn with_zygote_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.zygote_path = Some(path.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers_count == Some(0) {
            return Err(ConfigError::invalid("workers_count", "must be at least 1"));
        }
        if !(self.workers_per_cpu.is_finite() && self.workers_per_cpu > 0.0) {
            return Err(ConfigError::invalid(
                "workers_per_cpu",
                format!("must be a positive number, got {}", self.workers_per_cpu),
            ));
        }
        for (field, value) in [
            ("question_timeout", self.question_timeout),
            ("ping_timeout", self.ping_timeout),
            ("restart_timeout", self.restart_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.container_pids_limit <= 0 {
            return Err(ConfigError::invalid(
                "container_pids_limit",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Number of workers the pool keeps alive
    pub fn pool_size(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.pool_size_for(cpus)
    }

    pub(crate) fn pool_size_for(&self, cpus: usize) -> usize {
        match self.workers_count {
            Some(count) => count.max(1),
            None => ((cpus as f64 * self.workers_per_cpu).round() as usize).max(1),
        }
    }

    /// Zygote script path, resolved against the builtin root
    pub fn zygote_path(&self) -> PathBuf {
        match &self.zygote_path {
            Some(path) => path.clone(),
            None => self.builtin_root.join("python").join("zygote.py"),
        }
    }

    /// First `<venv>/bin/python3` that exists, else `python3` from `PATH`
    pub fn python_executable(&self) -> PathBuf {
        self.python_venv_search_paths
            .iter()
            .map(|venv| self.resolve_root_relative(venv).join("bin").join("python3"))
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from("python3"))
    }

    /// Executor image reference for container mode
    pub fn executor_image(&self) -> String {
        if let Some(repository) = &self.executor_image_repository {
            return format!("{}:{}", repository, self.executor_image_tag);
        }
        let image = format!("{}:{}", DEFAULT_EXECUTOR_IMAGE, self.executor_image_tag);
        match &self.cache_image_registry {
            Some(registry) => format!("{}/{}", registry.trim_end_matches('/'), image),
            None => image,
        }
    }

    fn resolve_root_relative(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.builtin_root.join(path)
        }
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

fn parse_millis(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    parse_var::<u64>(get, key).map(Duration::from_millis)
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = get(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(variable = key, value = %raw, "Ignoring unparsable flag");
            None
        }
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
