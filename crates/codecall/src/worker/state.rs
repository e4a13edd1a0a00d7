use std::fmt;

use serde::Serialize;

/// Lifecycle state of a worker
///
/// ```text
///   CREATED ──▶ WAITING ◀──▶ IN_CALL
///                 │  ▲          │
///                 ▼  │          ▼
///              RESTARTING ──▶ EXITING ──▶ EXITED
/// ```
///
/// Any state may jump straight to EXITED (`done()` or an observed exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// No child yet
    Created,
    /// Child running and idle
    Waiting,
    /// A call is outstanding
    InCall,
    /// Waiting for the zygote to confirm a restart
    Restarting,
    /// Child has been killed; exit not yet observed
    Exiting,
    /// Terminal
    Exited,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Created => "CREATED",
            WorkerState::Waiting => "WAITING",
            WorkerState::InCall => "IN_CALL",
            WorkerState::Restarting => "RESTARTING",
            WorkerState::Exiting => "EXITING",
            WorkerState::Exited => "EXITED",
        }
    }

    /// States in which the worker must own a child
    pub fn has_child(&self) -> bool {
        !matches!(self, WorkerState::Created | WorkerState::Exited)
    }

    /// States in which a pending call and its deadline must exist
    pub fn has_pending(&self) -> bool {
        matches!(self, WorkerState::InCall | WorkerState::Restarting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Exited)
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;

        match (self, next) {
            (Exited, _) => false,
            (_, Exited) => true,
            (Created, Waiting) => true,
            (Waiting, InCall | Restarting | Exiting) => true,
            (InCall, Waiting | Exiting) => true,
            (Restarting, Waiting | Exiting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
