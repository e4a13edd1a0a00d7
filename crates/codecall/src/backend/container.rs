//! Container backend: the zygote runs inside a Docker container.
//!
//! The container's entrypoint is the `codecall-executor` relay, which starts
//! the zygote natively and wraps every chunk from its four output channels in
//! an envelope line on the container's stdout. Requests go in over the
//! attached stdin unchanged.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{AttachContainerResults, LogOutput};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptions, CreateContainerOptions, CreateImageOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use codecall_protocol::{Envelope, LineBuffer, Utf8Decoder};
use futures::StreamExt;
use tempfile::TempDir;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{mount, CallRoots, ChildEvent, EventSender, ExecutionUnit, ExitInfo, Launcher, Spawned};
use crate::config::Config;
use crate::error::{CallError, Result};

/// Course mount point inside the container
pub const CONTAINER_COURSE_ROOT: &str = "/course";

const READER_DRAIN: Duration = Duration::from_millis(100);

/// Settings copied from [`Config`] that shape every container
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub image: String,
    pub pids_limit: i64,
    pub builtin_root: PathBuf,
    pub timeout_grace: Duration,
    pub drop_privileges: bool,
}

impl ContainerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.executor_image(),
            pids_limit: config.container_pids_limit,
            builtin_root: config.container_builtin_root.clone(),
            timeout_grace: config.container_timeout_grace,
            drop_privileges: config.drop_privileges,
        }
    }
}

/// Docker connection and executor image state shared by all container workers
pub struct ContainerRuntime {
    docker: Docker,
    settings: ContainerSettings,
    image_ready: OnceCell<()>,
}

impl ContainerRuntime {
    pub fn connect(config: &Config) -> Result<Arc<Self>> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Arc::new(Self {
            docker,
            settings: ContainerSettings::from_config(config),
            image_ready: OnceCell::new(),
        }))
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    /// Make sure the executor image is present, pulling it once if needed
    pub async fn ensure_image(&self) -> Result<()> {
        self.image_ready
            .get_or_try_init(|| self.pull_if_missing())
            .await
            .map(|_| ())
    }

    async fn pull_if_missing(&self) -> Result<()> {
        let image = &self.settings.image;
        info!(%image, "Checking for executor image");
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                info!(%image, "Executor image found");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {
                info!(%image, "Executor image not found, pulling from registry");
            }
            Err(e) => return Err(e.into()),
        }

        let started = Instant::now();
        let options = CreateImageOptions {
            from_image: Some(image.clone()),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            match item {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(%image, %status, "Pull progress");
                    }
                }
                Err(e) => {
                    error!(%image, elapsed = ?started.elapsed(), error = %e, "Error pulling image");
                    return Err(e.into());
                }
            }
        }
        info!(%image, elapsed = ?started.elapsed(), "Executor image pulled");
        Ok(())
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// The container is gone or Docker is already removing it (auto-remove)
fn is_already_removed(err: &DockerError) -> bool {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => true,
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => message.contains("already in progress"),
        _ => false,
    }
}

/// Container definition for one worker
pub fn container_body(settings: &ContainerSettings, mount_dir: &Path) -> ContainerCreateBody {
    let mut env = vec![format!(
        "CODECALL_BUILTIN_ROOT={}",
        settings.builtin_root.display()
    )];
    if settings.drop_privileges {
        env.push("CODECALL_DROP_PRIVILEGES=true".to_string());
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        env.push(format!("RUST_LOG={filter}"));
    }

    ContainerCreateBody {
        image: Some(settings.image.clone()),
        env: Some(env),
        open_stdin: Some(true),
        stdin_once: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![mount::course_bind_spec(mount_dir)]),
            auto_remove: Some(true),
            pids_limit: Some(settings.pids_limit),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Launches the zygote inside an executor container
pub struct ContainerLauncher {
    runtime: Arc<ContainerRuntime>,
    mount_dir: Option<TempDir>,
    mounted: bool,
    container_id: Option<String>,
}

impl ContainerLauncher {
    pub fn new(runtime: Arc<ContainerRuntime>) -> Self {
        Self {
            runtime,
            mount_dir: None,
            mounted: false,
            container_id: None,
        }
    }

    fn mount_dir(&mut self) -> Result<PathBuf> {
        if self.mount_dir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("codecall-worker-")
                .tempdir()?;
            self.mount_dir = Some(dir);
        }
        match &self.mount_dir {
            Some(dir) => Ok(dir.path().to_path_buf()),
            None => Err(CallError::backend("mount directory unavailable")),
        }
    }

    /// Force-remove the container whether it is running, stopped or never started
    async fn remove_container(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .runtime
            .docker
            .remove_container(id, Some(options))
            .await
        {
            Ok(()) => debug!(container_id = %id, "Removed container"),
            Err(e) if is_already_removed(&e) => {
                debug!(container_id = %id, "Container already removed")
            }
            Err(e) => error!(container_id = %id, error = %e, "Failed to remove container"),
        }
    }

    async fn attach_and_start(
        docker: &Docker,
        id: &str,
    ) -> std::result::Result<AttachContainerResults, DockerError> {
        let attached = docker
            .attach_container(
                id,
                Some(AttachContainerOptions {
                    stdin: true,
                    stdout: true,
                    stderr: true,
                    stream: true,
                    ..Default::default()
                }),
            )
            .await?;
        docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(attached)
    }
}

#[async_trait]
impl Launcher for ContainerLauncher {
    fn name(&self) -> &'static str {
        "container"
    }

    fn roots(&self, prepared_course: Option<&Path>) -> CallRoots {
        CallRoots {
            course: prepared_course.map(|_| PathBuf::from(CONTAINER_COURSE_ROOT)),
            builtin: self.runtime.settings.builtin_root.clone(),
        }
    }

    fn timeout_grace(&self) -> Duration {
        self.runtime.settings.timeout_grace
    }

    async fn launch(&mut self, worker_id: Uuid) -> Result<Spawned> {
        self.runtime.ensure_image().await?;
        let mount_dir = self.mount_dir()?;
        let docker = self.runtime.docker.clone();

        let options = CreateContainerOptions {
            name: Some(format!("codecall.worker.{worker_id}")),
            ..Default::default()
        };
        let body = container_body(&self.runtime.settings, &mount_dir);
        let container = docker.create_container(Some(options), body).await?;
        let id = container.id;
        self.container_id = Some(id.clone());

        let AttachContainerResults { output, input } =
            match Self::attach_and_start(&docker, &id).await {
                Ok(attached) => attached,
                Err(e) => {
                    // Auto-remove only covers containers that started
                    error!(%worker_id, container_id = %id, error = %e, "Failed to start executor container");
                    self.container_id = None;
                    self.remove_container(&id).await;
                    return Err(e.into());
                }
            };
        info!(%worker_id, container_id = %id, image = %self.runtime.settings.image, "Started executor container");

        let (tx, rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(relay_output(id.clone(), output, tx.clone()));

        let waiter_docker = docker.clone();
        let waiter_id = id.clone();
        tokio::spawn(async move {
            let mut wait = waiter_docker.wait_container(&waiter_id, None::<WaitContainerOptions>);
            let info = match wait.next().await {
                Some(Ok(response)) => ExitInfo::code(response.status_code),
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                    ExitInfo::code(code)
                }
                Some(Err(e)) => {
                    let _ = tx.send(ChildEvent::Failed(format!("error waiting for container: {e}")));
                    ExitInfo::default()
                }
                None => ExitInfo::default(),
            };
            let _ = tokio::time::timeout(READER_DRAIN, relay).await;
            debug!(container_id = %waiter_id, exit = %info, "Container exited");
            let _ = tx.send(ChildEvent::Exited(info));
        });

        Ok(Spawned {
            unit: Box::new(ContainerUnit {
                id,
                docker,
                input: Some(input),
            }),
            events: rx,
        })
    }

    async fn prepare_for_course(&mut self, course: &Path) -> Result<()> {
        let target = self.mount_dir()?;
        if self.mounted {
            mount::unbind(&target)?;
            self.mounted = false;
        }
        mount::bind(course, &target)?;
        self.mounted = true;
        debug!(course = %course.display(), mount = %target.display(), "Bound course checkout");
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(id) = self.container_id.take() {
            self.remove_container(&id).await;
        }
        if let Some(dir) = self.mount_dir.take() {
            if self.mounted {
                if let Err(e) = mount::unbind(dir.path()) {
                    // Leave the directory in place rather than deleting through a live mount
                    error!(error = %e, "Leaking course mount directory");
                    std::mem::forget(dir);
                    return;
                }
                self.mounted = false;
            }
            if let Err(e) = dir.close() {
                warn!(error = %e, "Failed to remove course mount directory");
            }
        }
    }
}

/// Decode envelope lines from the container's stdout into child events
async fn relay_output(
    container_id: String,
    mut output: Pin<Box<dyn futures::Stream<Item = std::result::Result<LogOutput, DockerError>> + Send>>,
    tx: EventSender,
) {
    let mut decoder = Utf8Decoder::new();
    let mut lines = LineBuffer::new();
    let mut log_decoder = Utf8Decoder::new();

    while let Some(item) = output.next().await {
        match item {
            Ok(LogOutput::StdOut { message }) => {
                lines.push(&decoder.decode(&message));
                while let Some(line) = lines.next_line() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event = match Envelope::from_line(&line) {
                        Ok(envelope) => ChildEvent::Output {
                            channel: envelope.channel,
                            text: envelope.text,
                        },
                        Err(e) => {
                            warn!(%container_id, error = %e, "Undecodable relay line");
                            ChildEvent::Malformed(line)
                        }
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
            Ok(LogOutput::StdErr { message }) => {
                let text = log_decoder.decode(&message);
                for line in text.lines().filter(|l| !l.is_empty()) {
                    debug!(target: "codecall::executor", %container_id, "{line}");
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(ChildEvent::Failed(format!("container output stream failed: {e}")));
                return;
            }
        }
    }
}

struct ContainerUnit {
    id: String,
    docker: Docker,
    input: Option<Pin<Box<dyn AsyncWrite + Send>>>,
}

#[async_trait]
impl ExecutionUnit for ContainerUnit {
    fn describe(&self) -> String {
        format!("container {}", self.id)
    }

    async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let input = self.input.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "container stdin is closed")
        })?;
        input.write_all(line.as_bytes()).await?;
        input.flush().await
    }

    async fn close_stdin(&mut self) {
        if let Some(mut input) = self.input.take() {
            let _ = input.shutdown().await;
        }
    }

    fn kill(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.id, "No runtime available to kill container");
            return;
        };
        let docker = self.docker.clone();
        let id = self.id.clone();
        handle.spawn(async move {
            if let Err(e) = docker.kill_container(&id, None::<KillContainerOptions>).await {
                debug!(container_id = %id, error = %e, "Container kill failed");
            }
        });
    }
}
