//! Builds workers for the configured isolation mode.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{ContainerLauncher, ContainerRuntime, NativeLauncher};
use crate::config::{Config, ExecutionMode};
use crate::error::Result;
use crate::worker::{CodeCaller, Worker, WorkerOptions};

type BuildFn = dyn Fn() -> Box<dyn CodeCaller> + Send + Sync;

#[derive(Clone)]
enum Kind {
    Native(NativeLauncher),
    Container(Arc<ContainerRuntime>),
    Custom(Arc<BuildFn>),
}

/// Creates fresh, unstarted workers
///
/// Cloning is cheap; clones share the container runtime.
#[derive(Clone)]
pub struct WorkerFactory {
    kind: Kind,
    options: WorkerOptions,
}

impl WorkerFactory {
    /// Factory for `config.execution_mode`
    ///
    /// Disabled mode builds native workers; the dispatcher just never pools them.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let options = WorkerOptions::from_config(config);
        match config.execution_mode {
            ExecutionMode::Native | ExecutionMode::Disabled => {
                Ok(Self::native(NativeLauncher::from_config(config), options))
            }
            ExecutionMode::Container => {
                let runtime = ContainerRuntime::connect(config)?;
                if config.ensure_executor_image_at_startup {
                    runtime.ensure_image().await?;
                }
                Ok(Self::container(runtime, options))
            }
        }
    }

    pub fn native(launcher: NativeLauncher, options: WorkerOptions) -> Self {
        info!(backend = "native", "Worker factory ready");
        Self {
            kind: Kind::Native(launcher),
            options,
        }
    }

    pub fn container(runtime: Arc<ContainerRuntime>, options: WorkerOptions) -> Self {
        info!(backend = "container", image = %runtime.settings().image, "Worker factory ready");
        Self {
            kind: Kind::Container(runtime),
            options,
        }
    }

    /// Factory around an arbitrary constructor
    pub fn from_fn(build: impl Fn() -> Box<dyn CodeCaller> + Send + Sync + 'static) -> Self {
        Self {
            kind: Kind::Custom(Arc::new(build)),
            options: WorkerOptions::default(),
        }
    }

    pub fn backend(&self) -> &'static str {
        match &self.kind {
            Kind::Native(_) => "native",
            Kind::Container(_) => "container",
            Kind::Custom(_) => "custom",
        }
    }

    pub fn create(&self) -> Box<dyn CodeCaller> {
        let worker: Box<dyn CodeCaller> = match &self.kind {
            Kind::Native(launcher) => Box::new(Worker::new(launcher.clone(), self.options.clone())),
            Kind::Container(runtime) => Box::new(Worker::new(
                ContainerLauncher::new(runtime.clone()),
                self.options.clone(),
            )),
            Kind::Custom(build) => build(),
        };
        debug!(worker_id = %worker.id(), backend = self.backend(), "Created worker");
        worker
    }
}
