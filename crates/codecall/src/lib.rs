//! # codecall
//!
//! Runs course-supplied code in isolated child processes and multiplexes
//! many concurrent calls onto a fixed set of them.
//!
//! - [`worker`]: one child, its lifecycle state machine and the call/restart protocol
//! - [`backend`]: how a child is started (native process or container)
//! - [`factory`]: builds workers for the configured isolation mode
//! - [`pool`]: fixed-size worker pool with FIFO or fail-fast acquisition
//! - [`dispatch`]: call resolution and the `with_worker` entry point
//!
//! ```ignore
//! use codecall::{CallRequest, CallType, CodeCallerService, Config, PrepareForCourse};
//!
//! let mut service = CodeCallerService::new(Config::from_env())?;
//! service.init().await?;
//!
//! let result = service
//!     .with_worker(PrepareForCourse::new("/courses/demo"), |worker| {
//!         Box::pin(async move {
//!             let request = CallRequest::new(CallType::Question, "server", "generate")
//!                 .with_directory("addNumbers")
//!                 .with_args(vec![serde_json::json!({})]);
//!             worker.call(request).await
//!         })
//!     })
//!     .await?;
//!
//! service.finish().await;
//! ```

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod pool;
pub mod telemetry;
pub mod worker;

pub use codecall_protocol::CallType;
pub use config::{Config, ConfigError, ExecutionMode};
pub use dispatch::{resolve_call, CodeCallerService, ResolvedCall};
pub use error::{CallError, Result, TimeoutPhase};
pub use factory::WorkerFactory;
pub use pool::{Pool, PoolMetrics, PooledWorker};
pub use worker::{
    CallDiagnostics, CallOutput, CallRequest, CodeCaller, PrepareForCourse, Worker, WorkerOptions,
    WorkerState,
};
