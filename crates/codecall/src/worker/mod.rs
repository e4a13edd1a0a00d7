//! Worker: owns one child and drives its lifecycle.
//!
//! A worker serialises every interaction with its child: `&mut self` on each
//! operation rules out a second call while one is outstanding. Reader tasks
//! feed [`ChildEvent`]s into a channel that the worker only consumes while
//! an operation is running; anything that arrived in between is drained at
//! the start of the next operation.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use codecall_protocol::{
    CallType, Channel, DataMessage, LineBuffer, RestartConfirmation, WireRequest, PING_REPLY,
    RESTART_REPLY,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{ChildEvent, EventReceiver, ExecutionUnit, ExitInfo, Launcher};
use crate::config::Config;
use crate::dispatch::resolve_call;
use crate::error::{CallError, Result, TimeoutPhase};

mod call;
mod state;

pub use call::{CallOutput, CallRequest, PrepareForCourse};
pub use state::WorkerState;

/// Capability shared by every worker flavour
///
/// The pool and dispatcher only ever see `Box<dyn CodeCaller>`.
#[async_trait]
pub trait CodeCaller: Send {
    fn id(&self) -> Uuid;

    fn state(&self) -> WorkerState;

    /// Course the worker was last prepared for
    fn course_path(&self) -> Option<&Path>;

    /// Start the child and confirm it answers a ping (no-op once running)
    async fn ensure_child(&mut self) -> Result<()>;

    /// Point the worker at a course checkout before calls are made
    async fn prepare_for_course(&mut self, prepare: PrepareForCourse) -> Result<()>;

    async fn call(&mut self, request: CallRequest) -> Result<CallOutput>;

    /// Return the child to a clean state
    ///
    /// `Ok(true)` means the worker can serve another caller; anything else
    /// means it must be discarded.
    async fn restart(&mut self) -> Result<bool>;

    /// Kill any child and release backend resources
    async fn done(&mut self);

    /// Wait (up to `limit`) for a killed child's exit; true once EXITED
    async fn wait_for_exit(&mut self, limit: Duration) -> bool;
}

/// Per-worker timeouts
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub question_timeout: Duration,
    pub ping_timeout: Duration,
    pub restart_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            question_timeout: config.question_timeout,
            ping_timeout: config.ping_timeout,
            restart_timeout: config.restart_timeout,
        }
    }
}

/// Snapshot of a worker attached to error logs
#[derive(Debug, Clone, Serialize)]
pub struct CallDiagnostics {
    pub worker_id: Uuid,
    pub backend: &'static str,
    pub state: WorkerState,
    pub child: Option<String>,
    pub pending_call: Option<CallType>,
    pub has_deadline: bool,
    pub poisoned: bool,
    pub stdout: String,
    pub stderr: String,
    pub output: String,
    pub data: String,
    pub restart: String,
    pub last_call: Option<WireRequest>,
}

#[derive(Debug, Clone, Copy)]
struct PendingCall {
    call_type: CallType,
    started: Instant,
}

#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: String,
    stderr: String,
    combined: String,
    data: LineBuffer,
}

enum Wait {
    Event(ChildEvent),
    Closed,
    Deadline,
}

/// A code caller backed by one child started through `L`
pub struct Worker<L: Launcher> {
    id: Uuid,
    state: WorkerState,
    launcher: L,
    options: WorkerOptions,
    child: Option<Box<dyn ExecutionUnit>>,
    events: Option<EventReceiver>,
    pending: Option<PendingCall>,
    deadline: Option<Instant>,
    output: CapturedOutput,
    restart_output: LineBuffer,
    course_path: Option<PathBuf>,
    forbidden_modules: Vec<String>,
    last_call: Option<WireRequest>,
    /// Protocol violation noticed between operations, reported by the next call
    fault: Option<String>,
    poisoned: bool,
    torn_down: bool,
}

impl<L: Launcher> Worker<L> {
    pub fn new(launcher: L, options: WorkerOptions) -> Self {
        let id = Uuid::now_v7();
        debug!(worker_id = %id, backend = launcher.name(), "Worker created");
        Self {
            id,
            state: WorkerState::Created,
            launcher,
            options,
            child: None,
            events: None,
            pending: None,
            deadline: None,
            output: CapturedOutput::default(),
            restart_output: LineBuffer::new(),
            course_path: None,
            forbidden_modules: Vec::new(),
            last_call: None,
            fault: None,
            poisoned: false,
            torn_down: false,
        }
    }

    /// An internal consistency check failed; the worker will not be reused
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn diagnostics(&self) -> CallDiagnostics {
        CallDiagnostics {
            worker_id: self.id,
            backend: self.launcher.name(),
            state: self.state,
            child: self.child.as_ref().map(|c| c.describe()),
            pending_call: self.pending.map(|p| p.call_type),
            has_deadline: self.deadline.is_some(),
            poisoned: self.poisoned,
            stdout: self.output.stdout.clone(),
            stderr: self.output.stderr.clone(),
            output: self.output.combined.clone(),
            data: self.output.data.as_str().to_string(),
            restart: self.restart_output.as_str().to_string(),
            last_call: self.last_call.clone(),
        }
    }

    fn trace(&self, operation: &str) {
        debug!(worker_id = %self.id, state = %self.state, "enter {operation}()");
    }

    fn log_error(&self, message: &str) {
        error!(
            worker_id = %self.id,
            state = %self.state,
            diagnostics = ?self.diagnostics(),
            "{message}"
        );
    }

    // ------------------------------------------------------------------
    // State bookkeeping
    // ------------------------------------------------------------------

    /// Verify the current state is one of `allowed` and that the child,
    /// pending call and deadline agree with it. Inconsistency poisons the
    /// worker.
    fn check_state(&mut self, allowed: Option<&[WorkerState]>) -> bool {
        if let Some(allowed) = allowed {
            if !allowed.contains(&self.state) {
                let expected: Vec<_> = allowed.iter().map(WorkerState::as_str).collect();
                self.log_error(&format!(
                    "Expected worker state {} but found {}",
                    expected.join(" or "),
                    self.state
                ));
                return false;
            }
        }

        let violation = if self.state.has_child() != self.child.is_some() {
            Some("child")
        } else if self.state.has_pending() != self.pending.is_some() {
            Some("pending call")
        } else if self.state.has_pending() != self.deadline.is_some() {
            Some("deadline")
        } else {
            None
        };

        if let Some(field) = violation {
            let presence = if self.state.has_child() || self.state.has_pending() {
                "missing"
            } else {
                "unexpectedly present"
            };
            self.log_error(&format!("Worker {field} {presence} in state {}", self.state));
            self.poisoned = true;
            return false;
        }
        true
    }

    fn set_state(&mut self, next: WorkerState) {
        if !self.state.can_transition_to(next) {
            self.log_error(&format!("Illegal transition {} -> {next}", self.state));
            self.poisoned = true;
        }
        debug!(worker_id = %self.id, from = %self.state, to = %next, "State change");
        self.state = next;
    }

    fn clear_pending(&mut self) {
        self.pending = None;
        self.deadline = None;
    }

    fn kill_child(&mut self) {
        if let Some(child) = self.child.as_mut() {
            debug!(worker_id = %self.id, child = %child.describe(), "Killing child");
            child.kill();
        }
    }

    /// Kill the child, move to EXITING and log the failure
    fn fail(&mut self, err: CallError) -> CallError {
        self.clear_pending();
        self.kill_child();
        if !matches!(self.state, WorkerState::Exiting | WorkerState::Exited) {
            self.set_state(WorkerState::Exiting);
        }
        self.check_state(None);
        self.log_error(&err.to_string());
        self.last_call = None;
        err
    }

    /// The child disappeared while we were waiting on it
    fn child_gone(&mut self, info: Option<ExitInfo>) -> CallError {
        let detail = match info {
            Some(info) => format!("child exited unexpectedly with {info}"),
            None => "child event stream closed unexpectedly".to_string(),
        };
        self.clear_pending();
        self.child = None;
        self.events = None;
        self.set_state(WorkerState::Exited);
        self.check_state(None);
        self.log_error(&detail);
        self.last_call = None;
        CallError::ChildCrashed(detail)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Handle an event that arrived while no call was being awaited
    fn handle_idle_event(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Output {
                channel: Channel::Restart,
                text,
            } => {
                self.restart_output.push(&text);
            }
            ChildEvent::Output {
                channel: Channel::Data,
                text,
            } if self.state == WorkerState::Waiting => {
                // Only the reply to an outstanding request may use the data channel
                let detail = format!("data channel output outside a call: {}", text.trim_end());
                self.fail(CallError::ProtocolViolation(detail.clone()));
                self.fault = Some(detail);
            }
            ChildEvent::Output { channel, text } => {
                if self.state == WorkerState::Exiting {
                    debug!(worker_id = %self.id, channel = channel.as_str(), "Ignoring output from exiting child");
                } else {
                    self.log_error(&format!(
                        "Unexpected {} output in state {}: {}",
                        channel.as_str(),
                        self.state,
                        text.trim_end()
                    ));
                }
            }
            ChildEvent::Malformed(line) => {
                warn!(worker_id = %self.id, state = %self.state, %line, "Ignoring undecodable relay line");
            }
            ChildEvent::Failed(message) => {
                if self.state == WorkerState::Waiting {
                    self.log_error(&format!("Child failed while idle: {message}"));
                    self.kill_child();
                    self.set_state(WorkerState::Exiting);
                    self.check_state(None);
                } else {
                    debug!(worker_id = %self.id, state = %self.state, %message, "Child stream failure");
                }
            }
            ChildEvent::Exited(info) => {
                if self.state == WorkerState::Exiting {
                    debug!(worker_id = %self.id, exit = %info, "Child exited");
                } else {
                    self.log_error(&format!("Child exited in state {} with {info}", self.state));
                }
                self.clear_pending();
                self.child = None;
                self.events = None;
                if self.state != WorkerState::Exited {
                    self.set_state(WorkerState::Exited);
                }
                self.check_state(None);
            }
        }
    }

    fn drain_events(&mut self) {
        while let Some(events) = self.events.as_mut() {
            match events.try_recv() {
                Ok(event) => self.handle_idle_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.handle_idle_event(ChildEvent::Exited(ExitInfo::default()));
                    break;
                }
            }
        }
    }

    async fn next_event(&mut self) -> Wait {
        let Some(events) = self.events.as_mut() else {
            return Wait::Closed;
        };
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                event = events.recv() => event.map_or(Wait::Closed, Wait::Event),
                _ = sleep_until(deadline) => Wait::Deadline,
            },
            None => events.recv().await.map_or(Wait::Closed, Wait::Event),
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    fn build_request(&self, request: &CallRequest) -> Result<WireRequest> {
        if request.call_type.is_internal() {
            return Err(CallError::InvalidCall(format!(
                "{} calls are issued by the worker itself",
                request.call_type
            )));
        }
        if request.file.trim().is_empty() {
            return Err(CallError::InvalidCall("missing file".to_string()));
        }
        if request.function.trim().is_empty() {
            return Err(CallError::InvalidCall("missing function".to_string()));
        }

        let roots = self.launcher.roots(self.course_path.as_deref());
        let resolved = resolve_call(request.call_type, request.directory.as_deref(), &roots)?;
        Ok(WireRequest {
            file: Some(request.file.clone()),
            fcn: request.function.clone(),
            args: request.args.clone(),
            cwd: resolved.cwd.as_deref().map(path_string),
            paths: resolved.paths.iter().map(|p| path_string(p)).collect(),
            forbidden_modules: self.forbidden_modules.clone(),
        })
    }

    fn internal_request(&self, call_type: CallType) -> WireRequest {
        let roots = self.launcher.roots(self.course_path.as_deref());
        let paths = resolve_call(call_type, None, &roots)
            .map(|resolved| resolved.paths.iter().map(|p| path_string(p)).collect())
            .unwrap_or_default();
        WireRequest::internal(call_type, paths)
    }

    /// Write one request and wait for its data-channel reply (WAITING -> IN_CALL -> ...)
    async fn exchange(
        &mut self,
        call_type: CallType,
        wire: WireRequest,
        limit: Duration,
    ) -> Result<CallOutput> {
        let line = wire
            .to_line()
            .map_err(|e| CallError::InvalidCall(e.to_string()))?;

        let now = Instant::now();
        self.output = CapturedOutput::default();
        self.pending = Some(PendingCall {
            call_type,
            started: now,
        });
        self.deadline = Some(now + limit);
        self.last_call = Some(wire);
        self.set_state(WorkerState::InCall);
        self.check_state(None);

        debug!(worker_id = %self.id, %call_type, ?limit, "Sending request");
        let written = match self.child.as_mut() {
            Some(child) => child.send_line(&line).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no child")),
        };
        if let Err(e) = written {
            return Err(self.fail(CallError::ChildCrashed(format!(
                "error writing request to child: {e}"
            ))));
        }

        loop {
            let event = match self.next_event().await {
                Wait::Event(event) => event,
                Wait::Deadline => {
                    return Err(self.fail(CallError::Timeout {
                        phase: TimeoutPhase::Call,
                        limit,
                    }))
                }
                Wait::Closed => return Err(self.child_gone(None)),
            };
            match event {
                ChildEvent::Output {
                    channel: Channel::Stdout,
                    text,
                } => {
                    self.output.stdout.push_str(&text);
                    self.output.combined.push_str(&text);
                }
                ChildEvent::Output {
                    channel: Channel::Stderr,
                    text,
                } => {
                    self.output.stderr.push_str(&text);
                    self.output.combined.push_str(&text);
                }
                ChildEvent::Output {
                    channel: Channel::Restart,
                    text,
                } => {
                    self.restart_output.push(&text);
                }
                ChildEvent::Output {
                    channel: Channel::Data,
                    text,
                } => {
                    if self.output.data.push(&text) {
                        return self.finish_call();
                    }
                }
                ChildEvent::Malformed(line) => {
                    return Err(self.fail(CallError::ProtocolViolation(format!(
                        "undecodable relay line: {line}"
                    ))))
                }
                ChildEvent::Failed(message) => {
                    return Err(self.fail(CallError::ChildCrashed(message)))
                }
                ChildEvent::Exited(info) => return Err(self.child_gone(Some(info))),
            }
        }
    }

    /// A complete line arrived on the data channel (IN_CALL -> WAITING or EXITING)
    fn finish_call(&mut self) -> Result<CallOutput> {
        let line = self.output.data.next_line().unwrap_or_default();
        if !self.output.data.is_empty() {
            let extra = self.output.data.take();
            return Err(self.fail(CallError::ProtocolViolation(format!(
                "data channel output after the result: {}",
                extra.trim_end()
            ))));
        }

        let message = match DataMessage::from_line(&line) {
            Ok(message) => message,
            Err(e) => {
                return Err(self.fail(CallError::ProtocolViolation(format!(
                    "error decoding data channel JSON: {e}"
                ))))
            }
        };

        let elapsed = self.pending.map(|p| p.started.elapsed());
        let call_type = self.pending.map(|p| p.call_type);
        self.clear_pending();
        self.set_state(WorkerState::Waiting);
        self.check_state(None);
        self.last_call = None;
        debug!(
            worker_id = %self.id,
            call_type = ?call_type,
            ?elapsed,
            present = message.present,
            "Call completed"
        );

        let output = std::mem::take(&mut self.output.combined);
        match message.into_value() {
            Some(data) => Ok(CallOutput { data, output }),
            None => Err(CallError::FunctionMissing),
        }
    }

    /// WAITING -> RESTARTING -> WAITING once the zygote confirms on the restart channel
    async fn await_restart_confirmation(&mut self) -> Result<bool> {
        let limit = self.options.restart_timeout;
        let now = Instant::now();
        self.pending = Some(PendingCall {
            call_type: CallType::Restart,
            started: now,
        });
        self.deadline = Some(now + limit);
        self.set_state(WorkerState::Restarting);
        self.check_state(None);

        loop {
            // The confirmation may already be buffered
            if let Some(line) = self.restart_output.next_line() {
                return match RestartConfirmation::from_line(&line) {
                    Ok(confirmation) if confirmation.exited => {
                        self.clear_pending();
                        self.set_state(WorkerState::Waiting);
                        self.check_state(None);
                        debug!(worker_id = %self.id, "Restart confirmed");
                        Ok(true)
                    }
                    Ok(_) => Err(self.fail(CallError::ProtocolViolation(
                        "restart confirmation reported exited = false".to_string(),
                    ))),
                    Err(e) => Err(self.fail(CallError::ProtocolViolation(format!(
                        "error decoding restart channel JSON: {e}"
                    )))),
                };
            }

            match self.next_event().await {
                Wait::Event(ChildEvent::Output {
                    channel: Channel::Restart,
                    text,
                }) => {
                    self.restart_output.push(&text);
                }
                Wait::Event(ChildEvent::Output {
                    channel: Channel::Data,
                    text,
                }) => {
                    return Err(self.fail(CallError::ProtocolViolation(format!(
                        "data channel output while restarting: {}",
                        text.trim_end()
                    ))))
                }
                Wait::Event(ChildEvent::Output { channel, text }) => {
                    self.log_error(&format!(
                        "Unexpected {} output while restarting: {}",
                        channel.as_str(),
                        text.trim_end()
                    ));
                }
                Wait::Event(ChildEvent::Malformed(line)) => {
                    return Err(self.fail(CallError::ProtocolViolation(format!(
                        "undecodable relay line: {line}"
                    ))))
                }
                Wait::Event(ChildEvent::Failed(message)) => {
                    return Err(self.fail(CallError::ChildCrashed(message)))
                }
                Wait::Event(ChildEvent::Exited(info)) => return Err(self.child_gone(Some(info))),
                Wait::Closed => return Err(self.child_gone(None)),
                Wait::Deadline => {
                    return Err(self.fail(CallError::Timeout {
                        phase: TimeoutPhase::Restart,
                        limit,
                    }))
                }
            }
        }
    }
}

#[async_trait]
impl<L: Launcher> CodeCaller for Worker<L> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> WorkerState {
        self.state
    }

    fn course_path(&self) -> Option<&Path> {
        self.course_path.as_deref()
    }

    async fn ensure_child(&mut self) -> Result<()> {
        self.trace("ensure_child");
        self.drain_events();
        match self.state {
            WorkerState::Created => {}
            WorkerState::Waiting => return Ok(()),
            actual => {
                return Err(CallError::InvalidState {
                    expected: "CREATED or WAITING",
                    actual,
                })
            }
        }
        self.check_state(Some(&[WorkerState::Created]));

        let spawned = match self.launcher.launch(self.id).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.set_state(WorkerState::Exited);
                self.check_state(None);
                self.log_error(&format!("Failed to start child: {e}"));
                return Err(match e {
                    CallError::ChildCrashed(_) => e,
                    other => CallError::ChildCrashed(format!("failed to start child: {other}")),
                });
            }
        };
        self.child = Some(spawned.unit);
        self.events = Some(spawned.events);
        self.set_state(WorkerState::Waiting);
        self.check_state(None);

        let limit = self.options.ping_timeout + self.launcher.timeout_grace();
        let wire = self.internal_request(CallType::Ping);
        match self.exchange(CallType::Ping, wire, limit).await {
            Ok(reply) if reply.data == json!(PING_REPLY) => {
                info!(worker_id = %self.id, backend = self.launcher.name(), "Child ready");
                Ok(())
            }
            Ok(reply) => Err(self.fail(CallError::ProtocolViolation(format!(
                "unexpected ping reply: {}",
                reply.data
            )))),
            Err(CallError::FunctionMissing) => Err(self.fail(CallError::ProtocolViolation(
                "child does not answer ping".to_string(),
            ))),
            Err(e) => Err(e),
        }
    }

    async fn prepare_for_course(&mut self, prepare: PrepareForCourse) -> Result<()> {
        self.trace("prepare_for_course");
        self.drain_events();
        if !self.check_state(Some(&[WorkerState::Created, WorkerState::Waiting])) {
            return Err(CallError::InvalidState {
                expected: "CREATED or WAITING",
                actual: self.state,
            });
        }

        self.forbidden_modules = prepare.forbidden_modules;
        if self.course_path.as_deref() == Some(prepare.course_path.as_path()) {
            debug!(worker_id = %self.id, "Already prepared for course");
            return Ok(());
        }
        self.launcher
            .prepare_for_course(&prepare.course_path)
            .await?;
        self.course_path = Some(prepare.course_path);
        Ok(())
    }

    async fn call(&mut self, request: CallRequest) -> Result<CallOutput> {
        self.trace("call");
        self.drain_events();
        if let Some(detail) = self.fault.take() {
            return Err(CallError::ProtocolViolation(detail));
        }
        if !self.check_state(Some(&[WorkerState::Created, WorkerState::Waiting])) {
            return Err(CallError::InvalidState {
                expected: "CREATED or WAITING",
                actual: self.state,
            });
        }

        // Resolution errors must surface before any child interaction
        let wire = self.build_request(&request)?;
        if self.state == WorkerState::Created {
            self.ensure_child().await?;
        }

        let limit = self.options.question_timeout + self.launcher.timeout_grace();
        self.exchange(request.call_type, wire, limit).await
    }

    async fn restart(&mut self) -> Result<bool> {
        self.trace("restart");
        self.drain_events();
        if self.poisoned {
            warn!(worker_id = %self.id, state = %self.state, "Refusing to restart poisoned worker");
            return Ok(false);
        }

        match self.state {
            WorkerState::Created => Ok(true),
            WorkerState::Exiting | WorkerState::Exited => Ok(false),
            WorkerState::InCall | WorkerState::Restarting => Err(CallError::InvalidState {
                expected: "CREATED, WAITING, EXITING or EXITED",
                actual: self.state,
            }),
            WorkerState::Waiting => {
                if !self.check_state(Some(&[WorkerState::Waiting])) {
                    return Ok(false);
                }
                self.restart_output.clear();

                let limit = self.options.question_timeout + self.launcher.timeout_grace();
                let wire = self.internal_request(CallType::Restart);
                match self.exchange(CallType::Restart, wire, limit).await {
                    Ok(reply) if reply.data == json!(RESTART_REPLY) => {}
                    Ok(reply) => {
                        return Err(self.fail(CallError::ProtocolViolation(format!(
                            "error while restarting: {}",
                            reply.data
                        ))))
                    }
                    Err(CallError::FunctionMissing) => {
                        return Err(self.fail(CallError::ProtocolViolation(
                            "child does not understand restart".to_string(),
                        )))
                    }
                    Err(e) => return Err(e),
                }
                self.await_restart_confirmation().await
            }
        }
    }

    async fn done(&mut self) {
        self.trace("done");
        if let Some(mut child) = self.child.take() {
            child.kill();
        }
        self.events = None;
        self.clear_pending();
        if self.state != WorkerState::Exited {
            self.set_state(WorkerState::Exited);
        }
        self.check_state(None);
        if !self.torn_down {
            self.torn_down = true;
            self.launcher.teardown().await;
        }
    }

    async fn wait_for_exit(&mut self, limit: Duration) -> bool {
        self.trace("wait_for_exit");
        let until = Instant::now() + limit;
        loop {
            self.drain_events();
            match self.state {
                WorkerState::Exited => return true,
                WorkerState::Exiting => {}
                _ => return false,
            }
            let Some(events) = self.events.as_mut() else {
                return false;
            };
            let event = tokio::select! {
                biased;
                event = events.recv() => event,
                _ = sleep_until(until) => return false,
            };
            self.handle_idle_event(event.unwrap_or(ChildEvent::Exited(ExitInfo::default())));
        }
    }
}

impl<L: Launcher> Drop for Worker<L> {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!(worker_id = %self.id, state = %self.state, "Worker dropped with a live child, killing it");
            child.kill();
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests;
