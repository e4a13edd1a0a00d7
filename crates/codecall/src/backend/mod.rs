//! Execution backends
//!
//! A [`Launcher`] starts one child for a worker and hands back an
//! [`ExecutionUnit`] (stdin + kill) together with a stream of
//! [`ChildEvent`]s produced by reader tasks. The worker never touches OS
//! handles directly, so the same state machine drives native processes and
//! containers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use codecall_protocol::{Channel, Utf8Decoder};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

pub mod container;
pub mod mount;
pub mod native;
#[cfg(test)]
pub(crate) mod scripted;

pub use container::{ContainerLauncher, ContainerRuntime};
pub use native::{spawn_child, NativeCommand, NativeLauncher};

/// Something that happened on a child's streams
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    /// Decoded text from one of the child's channels
    Output { channel: Channel, text: String },
    /// A relay line that could not be decoded
    Malformed(String),
    /// Reading from or talking to the child failed
    Failed(String),
    /// The child is gone
    Exited(ExitInfo),
}

/// How a child terminated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i64>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i64) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code().map(i64::from),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ChildEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChildEvent>;

/// The write side of a running child
#[async_trait]
pub trait ExecutionUnit: Send {
    /// Human-readable handle for logs (pid, container id)
    fn describe(&self) -> String;

    /// Write one request line (already newline-terminated)
    async fn send_line(&mut self, line: &str) -> std::io::Result<()>;

    /// Close the child's stdin; the zygote exits when it sees EOF
    async fn close_stdin(&mut self);

    /// Best-effort termination; the exit arrives later as [`ChildEvent::Exited`]
    fn kill(&mut self);
}

/// A freshly started child
pub struct Spawned {
    pub unit: Box<dyn ExecutionUnit>,
    pub events: EventReceiver,
}

/// Where call resolution anchors course and built-in paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRoots {
    /// Course checkout as seen by the child, if one has been prepared
    pub course: Option<PathBuf>,
    /// Built-in code tree as seen by the child
    pub builtin: PathBuf,
}

/// Starts children for one worker
#[async_trait]
pub trait Launcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Path roots as seen from inside the child
    fn roots(&self, prepared_course: Option<&Path>) -> CallRoots;

    /// Added to every call deadline
    fn timeout_grace(&self) -> Duration {
        Duration::ZERO
    }

    async fn launch(&mut self, worker_id: Uuid) -> Result<Spawned>;

    /// Make `course` visible to the child
    async fn prepare_for_course(&mut self, _course: &Path) -> Result<()> {
        Ok(())
    }

    /// Release anything held outside the child (containers, mounts)
    async fn teardown(&mut self) {}
}

/// Forward a byte stream as decoded text events until EOF
pub fn spawn_reader<R>(channel: Channel, mut reader: R, tx: EventSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::new();
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() && tx.send(ChildEvent::Output { channel, text }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ChildEvent::Failed(format!(
                        "error reading {}: {e}",
                        channel.as_str()
                    )));
                    return;
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = tx.send(ChildEvent::Output {
                channel,
                text: rest,
            });
        }
        debug!(channel = channel.as_str(), "Child stream closed");
    })
}
