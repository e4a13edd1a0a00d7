//! Call dispatch
//!
//! [`resolve_call`] turns a call type and directory into the working
//! directory and import paths the child should use. [`CodeCallerService`]
//! is the entry point for request handlers: it owns the pool (or, with
//! pooling disabled, a factory) and lends out prepared workers.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use codecall_protocol::CallType;
use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::backend::CallRoots;
use crate::config::{Config, ConfigError, ExecutionMode};
use crate::error::{CallError, Result};
use crate::factory::WorkerFactory;
use crate::pool::{Pool, PoolConfig, PoolMetrics};
use crate::worker::{CodeCaller, PrepareForCourse};

/// Where a call runs and what it may import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCall {
    pub cwd: Option<PathBuf>,
    pub paths: Vec<PathBuf>,
}

/// Resolve `call_type` + `directory` against the backend's roots
pub fn resolve_call(
    call_type: CallType,
    directory: Option<&str>,
    roots: &CallRoots,
) -> Result<ResolvedCall> {
    let builtin_python = roots.builtin.join("python");

    if !call_type.needs_directory() {
        return Ok(ResolvedCall {
            cwd: None,
            paths: vec![builtin_python],
        });
    }

    let directory = directory
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| CallError::InvalidCall(format!("{call_type} call without a directory")))?;
    let directory = relative_directory(directory)?;

    if !call_type.needs_course() {
        return Ok(ResolvedCall {
            cwd: Some(roots.builtin.join("elements").join(directory)),
            paths: vec![builtin_python],
        });
    }

    let course = roots.course.as_deref().ok_or_else(|| {
        CallError::InvalidCall(format!(
            "{call_type} call before the worker was prepared for a course"
        ))
    })?;
    let tree = match call_type {
        CallType::Question => "questions",
        _ => "elements",
    };
    Ok(ResolvedCall {
        cwd: Some(course.join(tree).join(directory)),
        paths: vec![builtin_python, course.join("serverFilesCourse")],
    })
}

/// Only plain relative components may appear in a call directory
fn relative_directory(directory: &str) -> Result<&Path> {
    let path = Path::new(directory);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(CallError::InvalidCall(format!(
            "directory must be relative and stay inside its tree: {directory}"
        )));
    }
    Ok(path)
}

enum Backend {
    Uninitialized,
    Pooled(Pool),
    /// Disabled mode: one throwaway worker per use
    Unpooled(WorkerFactory),
}

/// Lends prepared workers to request handlers
pub struct CodeCallerService {
    config: Config,
    factory: Option<WorkerFactory>,
    backend: Backend,
    finished: AtomicBool,
}

impl CodeCallerService {
    pub fn new(config: Config) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            factory: None,
            backend: Backend::Uninitialized,
            finished: AtomicBool::new(false),
        })
    }

    /// Use `factory` instead of building one from the configuration
    pub fn with_factory(
        config: Config,
        factory: WorkerFactory,
    ) -> std::result::Result<Self, ConfigError> {
        let mut service = Self::new(config)?;
        service.factory = Some(factory);
        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the pool (or factory in disabled mode), warming it up when configured
    pub async fn init(&mut self) -> Result<()> {
        if !matches!(self.backend, Backend::Uninitialized) {
            return Ok(());
        }
        let factory = match self.factory.take() {
            Some(factory) => factory,
            None => WorkerFactory::from_config(&self.config).await?,
        };

        if self.config.execution_mode == ExecutionMode::Disabled {
            info!("Worker pool disabled, creating a worker per use");
            self.backend = Backend::Unpooled(factory);
            return Ok(());
        }

        let pool = Pool::new(PoolConfig::from_config(&self.config), factory);
        if self.config.warm_up {
            pool.warm_up().await;
        }
        self.backend = Backend::Pooled(pool);
        Ok(())
    }

    /// Run `f` on a worker prepared for `course`
    ///
    /// The worker is restarted and returned (or replaced) afterwards
    /// whatever `f` returns.
    pub async fn with_worker<T, F>(&self, course: PrepareForCourse, f: F) -> Result<T>
    where
        F: for<'w> FnOnce(&'w mut dyn CodeCaller) -> BoxFuture<'w, Result<T>> + Send,
        T: Send,
    {
        if self.finished.load(Ordering::SeqCst) {
            return Err(CallError::PoolClosed);
        }
        match &self.backend {
            Backend::Uninitialized => Err(CallError::PoolClosed),
            Backend::Pooled(pool) => pool.with_worker(course, f).await,
            Backend::Unpooled(factory) => {
                let mut worker = factory.create();
                debug!(worker_id = %worker.id(), "Created unpooled worker");
                let result = match worker.prepare_for_course(course).await {
                    Ok(()) => f(&mut *worker).await,
                    Err(e) => Err(e),
                };
                worker.done().await;
                result
            }
        }
    }

    /// Pool metrics; `None` when there is no pool
    pub fn metrics(&self) -> Option<PoolMetrics> {
        match &self.backend {
            Backend::Pooled(pool) => Some(pool.metrics()),
            _ => None,
        }
    }

    /// Shut the pool down; later calls fail with [`CallError::PoolClosed`]
    pub async fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Backend::Pooled(pool) = &self.backend {
            pool.shutdown().await;
        }
        info!("Code caller service finished");
    }
}
