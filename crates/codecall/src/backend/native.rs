//! Native backend: the zygote runs as a direct child process.
//!
//! Besides stdin/stdout/stderr the child gets two extra pipes installed as
//! fd 3 (data) and fd 4 (restart confirmations).

use std::ffi::OsString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codecall_protocol::Channel;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, pipe2, Pid};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{spawn_reader, CallRoots, ChildEvent, ExecutionUnit, ExitInfo, Launcher, Spawned};
use crate::config::Config;
use crate::error::{CallError, Result};

/// Child fd carrying `{"present", "val"}` results
pub const DATA_FD: RawFd = 3;
/// Child fd carrying `{"exited"}` restart confirmations
pub const RESTART_FD: RawFd = 4;

/// How long the reaper waits for stream readers to drain after the child exits.
/// Grandchildren can hold the pipes open indefinitely.
const READER_DRAIN: Duration = Duration::from_millis(100);

/// Program, arguments and environment for a child process
#[derive(Debug, Clone)]
pub struct NativeCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
}

impl NativeCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// `<python> -B <zygote>` as configured
    pub fn python_zygote(config: &Config) -> Self {
        let mut command = Self::new(config.python_executable())
            .arg("-B")
            .arg(config.zygote_path())
            .env("PYTHONIOENCODING", "utf-8");
        if config.drop_privileges {
            command = command.env("DROP_PRIVILEGES", "1");
        }
        command
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Start `command` with fds 0-4 wired to the returned unit and event stream
pub fn spawn_child(command: &NativeCommand) -> Result<Spawned> {
    let (data_read, data_write) = pipe2(OFlag::O_CLOEXEC)?;
    let (restart_read, restart_write) = pipe2(OFlag::O_CLOEXEC)?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let remap = [
        (data_write.as_raw_fd(), DATA_FD),
        (restart_write.as_raw_fd(), RESTART_FD),
    ];
    // Safety: the closure only issues fcntl/dup2 syscalls, which are
    // async-signal-safe, and allocates nothing.
    unsafe {
        cmd.pre_exec(move || install_fds(&remap));
    }

    let mut child = cmd.spawn().map_err(|e| {
        CallError::ChildCrashed(format!(
            "failed to spawn {}: {e}",
            command.program.display()
        ))
    })?;
    // The child holds its own copies now
    drop(data_write);
    drop(restart_write);

    let pid = child.id().map(|id| Pid::from_raw(id as i32));
    let missing = |name: &str| CallError::ChildCrashed(format!("child {name} was not captured"));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let readers = vec![
        spawn_reader(Channel::Stdout, stdout, tx.clone()),
        spawn_reader(Channel::Stderr, stderr, tx.clone()),
        spawn_reader(Channel::Data, pipe_receiver(data_read)?, tx.clone()),
        spawn_reader(Channel::Restart, pipe_receiver(restart_read)?, tx.clone()),
    ];

    let exited = Arc::new(AtomicBool::new(false));
    let reaped = exited.clone();
    tokio::spawn(async move {
        let status = child.wait().await;
        reaped.store(true, Ordering::SeqCst);
        let _ = tokio::time::timeout(READER_DRAIN, futures::future::join_all(readers)).await;
        let info = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => {
                let _ = tx.send(ChildEvent::Failed(format!("error waiting for child: {e}")));
                ExitInfo::default()
            }
        };
        debug!(exit = %info, "Child reaped");
        let _ = tx.send(ChildEvent::Exited(info));
    });

    Ok(Spawned {
        unit: Box::new(NativeUnit {
            pid,
            stdin: Some(stdin),
            exited,
            term_sent: false,
        }),
        events: rx,
    })
}

/// Move the pipe ends above the target range first so a later dup2 cannot
/// clobber an earlier source, then install them on their fixed numbers.
fn install_fds(remap: &[(RawFd, RawFd); 2]) -> std::io::Result<()> {
    let mut moved = [0 as RawFd; 2];
    for (slot, (source, _)) in moved.iter_mut().zip(remap.iter()) {
        *slot = fcntl(*source, FcntlArg::F_DUPFD_CLOEXEC(10))?;
    }
    for (fd, (_, target)) in moved.iter().zip(remap.iter()) {
        dup2(*fd, *target)?;
    }
    Ok(())
}

fn pipe_receiver(fd: OwnedFd) -> Result<pipe::Receiver> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(pipe::Receiver::from_owned_fd(fd)?)
}

struct NativeUnit {
    pid: Option<Pid>,
    stdin: Option<ChildStdin>,
    exited: Arc<AtomicBool>,
    term_sent: bool,
}

#[async_trait]
impl ExecutionUnit for NativeUnit {
    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid {pid}"),
            None => "pid ?".to_string(),
        }
    }

    async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdin is closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }

    async fn close_stdin(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
    }

    fn kill(&mut self) {
        let Some(pid) = self.pid else { return };
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        // SIGTERM first; a child that ignores it gets SIGKILL on the next request
        let signal = if self.term_sent {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        self.term_sent = true;
        match kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(%pid, ?signal, error = %e, "Failed to signal child"),
        }
    }
}

/// Launches the zygote as a native child process
#[derive(Debug, Clone)]
pub struct NativeLauncher {
    command: NativeCommand,
    builtin_root: PathBuf,
}

impl NativeLauncher {
    pub fn new(command: NativeCommand, builtin_root: impl Into<PathBuf>) -> Self {
        Self {
            command,
            builtin_root: builtin_root.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            NativeCommand::python_zygote(config),
            config.builtin_root.clone(),
        )
    }
}

#[async_trait]
impl Launcher for NativeLauncher {
    fn name(&self) -> &'static str {
        "native"
    }

    fn roots(&self, prepared_course: Option<&Path>) -> CallRoots {
        CallRoots {
            course: prepared_course.map(Path::to_path_buf),
            builtin: self.builtin_root.clone(),
        }
    }

    async fn launch(&mut self, worker_id: Uuid) -> Result<Spawned> {
        let spawned = spawn_child(&self.command)?;
        info!(
            %worker_id,
            program = %self.command.program.display(),
            child = %spawned.unit.describe(),
            "Started native child"
        );
        Ok(spawned)
    }
}
