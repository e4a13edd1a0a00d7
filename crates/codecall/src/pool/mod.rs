//! Fixed-size worker pool
//!
//! Workers live in an idle queue guarded by a FIFO semaphore with one permit
//! per worker. A checked-out [`PooledWorker`] holds its permit until the
//! worker (or its replacement) is back in the idle queue, so the pool never
//! has more than `size` live workers and waiters are served in arrival
//! order.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CallError, Result};
use crate::factory::WorkerFactory;
use crate::worker::{CodeCaller, PrepareForCourse};

mod load;

pub use load::PoolMetrics;
use load::PoolLoad;

/// Pool sizing and acquisition behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers (min == max)
    pub size: usize,
    /// Wait FIFO for a worker instead of failing after `overload_delay`
    pub use_queue: bool,
    #[serde(with = "crate::config::duration_millis")]
    pub overload_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 1,
            use_queue: true,
            overload_delay: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            size: config.pool_size(),
            use_queue: config.use_queue,
            overload_delay: config.overload_delay,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn with_use_queue(mut self, use_queue: bool) -> Self {
        self.use_queue = use_queue;
        self
    }

    pub fn with_overload_delay(mut self, delay: Duration) -> Self {
        self.overload_delay = delay;
        self
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: WorkerFactory,
    idle: Mutex<VecDeque<Box<dyn CodeCaller>>>,
    permits: Arc<Semaphore>,
    load: PoolLoad,
    closed: AtomicBool,
}

/// Fixed-size pool of code callers
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create `config.size` unstarted workers
    pub fn new(config: PoolConfig, factory: WorkerFactory) -> Self {
        let size = config.size.max(1);
        let idle: VecDeque<_> = (0..size).map(|_| factory.create()).collect();
        info!(
            size,
            use_queue = config.use_queue,
            overload_delay = ?config.overload_delay,
            backend = factory.backend(),
            "Worker pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                config: PoolConfig { size, ..config },
                factory,
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(size)),
                load: PoolLoad::new(size),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    /// Start every idle worker's child concurrently
    ///
    /// Workers that fail to start are replaced with fresh (unstarted) ones.
    pub async fn warm_up(&self) {
        let size = self.inner.config.size as u32;
        let Ok(permits) = self.inner.permits.clone().acquire_many_owned(size).await else {
            return;
        };
        let mut workers: Vec<_> = self.inner.idle.lock().drain(..).collect();
        let results =
            futures::future::join_all(workers.iter_mut().map(|worker| worker.ensure_child())).await;

        let mut ready = VecDeque::with_capacity(workers.len());
        let mut failed = 0usize;
        for (mut worker, result) in workers.into_iter().zip(results) {
            match result {
                Ok(()) => ready.push_back(worker),
                Err(e) => {
                    warn!(worker_id = %worker.id(), error = %e, "Worker failed to warm up, replacing");
                    failed += 1;
                    worker.done().await;
                    self.inner.load.replaced();
                    ready.push_back(self.inner.factory.create());
                }
            }
        }
        self.inner.idle.lock().extend(ready);
        drop(permits);
        info!(size, failed, "Worker pool warmed up");
    }

    /// Check out a worker
    ///
    /// Waits FIFO when queueing is enabled; otherwise gives up with
    /// [`CallError::Overload`] after `overload_delay`.
    pub async fn acquire(&self) -> Result<PooledWorker> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CallError::PoolClosed);
        }

        let waiting = self.inner.load.waiting();
        let acquire = self.inner.permits.clone().acquire_owned();
        let permit = if self.inner.config.use_queue {
            acquire.await.map_err(|_| CallError::PoolClosed)?
        } else {
            let delay = self.inner.config.overload_delay;
            match tokio::time::timeout(delay, acquire).await {
                Ok(permit) => permit.map_err(|_| CallError::PoolClosed)?,
                Err(_) => {
                    warn!(
                        waited = ?delay,
                        pending = self.inner.load.pending(),
                        "No worker available, rejecting call"
                    );
                    return Err(CallError::Overload { waited: delay });
                }
            }
        };
        drop(waiting);

        let worker = self.inner.take_idle();
        self.inner.load.checked_out();
        debug!(worker_id = %worker.id(), borrowed = self.inner.load.borrowed(), "Worker checked out");
        Ok(PooledWorker {
            worker: Some(worker),
            permit: Some(permit),
            pool: self.inner.clone(),
        })
    }

    /// Return a worker; it is restarted and kept, or replaced if the restart fails
    pub async fn release(&self, worker: PooledWorker) {
        worker.release().await;
    }

    /// Tear a worker down and replace it
    pub async fn destroy(&self, worker: PooledWorker) {
        worker.destroy().await;
    }

    /// Run `f` on a worker prepared for `course`, then return the worker in every outcome
    pub async fn with_worker<T, F>(&self, course: PrepareForCourse, f: F) -> Result<T>
    where
        F: for<'w> FnOnce(&'w mut dyn CodeCaller) -> BoxFuture<'w, Result<T>> + Send,
        T: Send,
    {
        let mut worker = self.acquire().await?;
        let result = match worker.prepare_for_course(course).await {
            Ok(()) => f(&mut *worker).await,
            Err(e) => Err(e),
        };
        worker.release().await;
        result
    }

    pub fn metrics(&self) -> PoolMetrics {
        let available = self.inner.idle.lock().len();
        self.inner.load.snapshot(available)
    }

    /// Fraction of workers checked out
    pub fn load_ratio(&self) -> f64 {
        self.inner.load.load_ratio()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Tear down idle workers and refuse further acquisitions
    ///
    /// Checked-out workers are torn down as they come back.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let idle: Vec<_> = self.inner.idle.lock().drain(..).collect();
        let count = idle.len();
        for mut worker in idle {
            worker.done().await;
            self.inner.load.retired();
        }
        info!(
            torn_down = count,
            still_borrowed = self.inner.load.borrowed(),
            "Worker pool shut down"
        );
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_idle(&self) -> Box<dyn CodeCaller> {
        match self.idle.lock().pop_front() {
            Some(worker) => worker,
            None => {
                error!("Idle queue empty while holding a permit, creating a worker");
                self.load.replaced();
                self.factory.create()
            }
        }
    }

    /// Restart a returned worker and put it (or a replacement) back
    async fn recycle(&self, mut worker: Box<dyn CodeCaller>, permit: OwnedSemaphorePermit) {
        let keep = match worker.restart().await {
            Ok(true) => true,
            Ok(false) => {
                info!(worker_id = %worker.id(), state = %worker.state(), "Worker could not be restarted, replacing");
                false
            }
            Err(e) if e.is_fatal_to_worker() => {
                warn!(worker_id = %worker.id(), error = %e, "Error restarting worker, replacing");
                false
            }
            Err(e) => {
                error!(worker_id = %worker.id(), state = %worker.state(), error = %e, "Worker returned in an unusable state, replacing");
                false
            }
        };

        if keep && !self.is_closed() {
            debug!(worker_id = %worker.id(), "Worker returned to pool");
            self.idle.lock().push_back(worker);
        } else {
            self.retire(worker).await;
        }
        self.load.checked_in();
        drop(permit);
    }

    async fn retire(&self, mut worker: Box<dyn CodeCaller>) {
        worker.done().await;
        if self.is_closed() {
            self.load.retired();
            return;
        }
        let replacement = self.factory.create();
        debug!(old = %worker.id(), new = %replacement.id(), "Replaced worker");
        self.load.replaced();
        self.idle.lock().push_back(replacement);
    }
}

/// A checked-out worker
///
/// Dereferences to the worker. Call [`PooledWorker::release`] when done;
/// dropping it instead recycles the worker on a background task.
pub struct PooledWorker {
    worker: Option<Box<dyn CodeCaller>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledWorker {
    pub fn id(&self) -> Uuid {
        self.deref().id()
    }

    /// Restart the worker and return it (or a replacement) to the pool
    pub async fn release(mut self) {
        if let (Some(worker), Some(permit)) = (self.worker.take(), self.permit.take()) {
            self.pool.recycle(worker, permit).await;
        }
    }

    /// Tear the worker down and put a fresh one in its place
    pub async fn destroy(mut self) {
        if let (Some(worker), Some(permit)) = (self.worker.take(), self.permit.take()) {
            self.pool.retire(worker).await;
            self.pool.load.checked_in();
            drop(permit);
        }
    }
}

impl fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PooledWorker");
        if let Some(worker) = self.worker.as_deref() {
            s.field("id", &worker.id()).field("state", &worker.state());
        }
        s.finish_non_exhaustive()
    }
}

impl Deref for PooledWorker {
    type Target = dyn CodeCaller;

    fn deref(&self) -> &Self::Target {
        self.worker
            .as_deref()
            .expect("pooled worker is present until released")
    }
}

impl DerefMut for PooledWorker {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.worker
            .as_deref_mut()
            .expect("pooled worker is present until released")
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        let (Some(worker), Some(permit)) = (self.worker.take(), self.permit.take()) else {
            return;
        };
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(worker_id = %worker.id(), "Pooled worker dropped without release, recycling in background");
                handle.spawn(async move { pool.recycle(worker, permit).await });
            }
            Err(_) => {
                // No runtime to restart on; the worker kills its child on drop
                pool.load.checked_in();
                drop(worker);
                drop(permit);
            }
        }
    }
}
