//! In-memory backend for unit tests.
//!
//! The "child" is a task reading request lines from a duplex pipe and
//! answering with scripted steps. Ping and restart get zygote-like default
//! replies unless the script overrides them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codecall_protocol::{Channel, WireRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{CallRoots, ChildEvent, EventSender, ExecutionUnit, ExitInfo, Launcher, Spawned};
use crate::error::{CallError, Result};

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Stdout(String),
    Stderr(String),
    /// Raw text on the data channel
    Data(String),
    /// Raw text on the restart channel
    Restart(String),
    Malformed(String),
    Sleep(Duration),
    Exit(i64),
}

impl Step {
    pub(crate) fn value(val: serde_json::Value) -> Self {
        Step::Data(format!("{}\n", serde_json::json!({"present": true, "val": val})))
    }

    pub(crate) fn missing() -> Self {
        Step::Data("{\"present\":false}\n".to_string())
    }
}

pub(crate) type Script = Arc<dyn Fn(&WireRequest) -> Option<Vec<Step>> + Send + Sync>;

/// Counters shared between a test and the launchers it hands out
#[derive(Debug, Default)]
pub(crate) struct ScriptStats {
    pub launches: AtomicUsize,
    pub requests: AtomicUsize,
    pub teardowns: AtomicUsize,
}

#[derive(Clone)]
pub(crate) struct ScriptedLauncher {
    script: Script,
    stats: Arc<ScriptStats>,
    fail_launch: bool,
}

impl ScriptedLauncher {
    pub(crate) fn new(
        script: impl Fn(&WireRequest) -> Option<Vec<Step>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Arc::new(script),
            stats: Arc::new(ScriptStats::default()),
            fail_launch: false,
        }
    }

    /// Answers every user call with `present = false`
    pub(crate) fn zygote() -> Self {
        Self::new(|_| None)
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::zygote()
        }
    }

    pub(crate) fn stats(&self) -> Arc<ScriptStats> {
        self.stats.clone()
    }
}

pub(crate) const BUILTIN_ROOT: &str = "/builtin";

#[async_trait]
impl Launcher for ScriptedLauncher {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn roots(&self, prepared_course: Option<&Path>) -> CallRoots {
        CallRoots {
            course: prepared_course.map(Path::to_path_buf),
            builtin: PathBuf::from(BUILTIN_ROOT),
        }
    }

    async fn launch(&mut self, _worker_id: Uuid) -> Result<Spawned> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch {
            return Err(CallError::ChildCrashed("scripted launch failure".into()));
        }

        let (host, child) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_child(
            child,
            self.script.clone(),
            self.stats.clone(),
            tx,
            kill_rx,
        ));

        Ok(Spawned {
            unit: Box::new(ScriptedUnit {
                stdin: Some(host),
                kill_tx,
            }),
            events: rx,
        })
    }

    async fn teardown(&mut self) {
        self.stats.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn default_reply(request: &WireRequest) -> Vec<Step> {
    match request.fcn.as_str() {
        "ping" if request.file.is_none() => vec![Step::value(serde_json::json!("pong"))],
        "restart" if request.file.is_none() => vec![
            Step::value(serde_json::json!("success")),
            Step::Restart("{\"exited\":true}\n".to_string()),
        ],
        _ => vec![Step::missing()],
    }
}

const SIGTERM: i32 = 15;

async fn run_child(
    stdin: DuplexStream,
    script: Script,
    stats: Arc<ScriptStats>,
    tx: EventSender,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
) {
    let killed = ExitInfo {
        code: None,
        signal: Some(SIGTERM),
    };
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = kill_rx.recv() => {
                let _ = tx.send(ChildEvent::Exited(killed));
                return;
            }
        };
        let Ok(Some(line)) = line else {
            let _ = tx.send(ChildEvent::Exited(ExitInfo::code(0)));
            return;
        };
        stats.requests.fetch_add(1, Ordering::SeqCst);

        let request = match WireRequest::from_line(&line) {
            Ok(request) => request,
            Err(_) => {
                let _ = tx.send(ChildEvent::Exited(ExitInfo::code(1)));
                return;
            }
        };
        let steps = script(&request).unwrap_or_else(|| default_reply(&request));

        for step in steps {
            let (channel, text) = match step {
                Step::Stdout(text) => (Channel::Stdout, text),
                Step::Stderr(text) => (Channel::Stderr, text),
                Step::Data(text) => (Channel::Data, text),
                Step::Restart(text) => (Channel::Restart, text),
                Step::Malformed(line) => {
                    let _ = tx.send(ChildEvent::Malformed(line));
                    continue;
                }
                Step::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => continue,
                        _ = kill_rx.recv() => {
                            let _ = tx.send(ChildEvent::Exited(killed));
                            return;
                        }
                    }
                }
                Step::Exit(code) => {
                    let _ = tx.send(ChildEvent::Exited(ExitInfo::code(code)));
                    return;
                }
            };
            let _ = tx.send(ChildEvent::Output { channel, text });
        }
    }
}

struct ScriptedUnit {
    stdin: Option<DuplexStream>,
    kill_tx: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl ExecutionUnit for ScriptedUnit {
    fn describe(&self) -> String {
        "scripted child".to_string()
    }

    async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }

    async fn close_stdin(&mut self) {
        self.stdin = None;
    }

    fn kill(&mut self) {
        let _ = self.kill_tx.send(());
    }
}
