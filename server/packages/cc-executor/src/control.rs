//! Lifecycle state machine for a supervised process.
//!
//! Transitions are computed by [`next_state`], a pure function, and applied
//! by [`apply_command`] / [`finish`] while holding the handle's state lock so
//! that signal delivery and the notification describing it are observed in
//! the same order by every client.

use std::fmt;

use cc_executor_error::ExecutorError;
use cc_executor_protocol::{ControlKind, ProcessStatus};
use serde::Serialize;

use crate::supervisor::{ProcessHandle, SignalKind, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Spawned,
    Command(ControlKind),
    Exited(i32),
    Errored,
}

pub fn next_state(
    current: ProcessState,
    event: ControlEvent,
) -> Result<ProcessState, ExecutorError> {
    use ProcessState::*;

    match (current, event) {
        (NotStarted, ControlEvent::Spawned) => Ok(Running),
        (NotStarted, ControlEvent::Errored) => Ok(Failed),
        (NotStarted, ControlEvent::Command(_)) => Err(ExecutorError::ProcessNotFound {
            message: "no process is running".to_string(),
        }),

        (Running, ControlEvent::Command(ControlKind::Pause)) => Ok(Paused),
        (Paused, ControlEvent::Command(ControlKind::Resume)) => Ok(Running),
        (Running | Paused, ControlEvent::Command(ControlKind::Cancel)) => Ok(Cancelled),
        (state, ControlEvent::Command(kind)) => Err(ExecutorError::InvalidState {
            command: kind.as_str().to_string(),
            state: state.as_str().to_string(),
        }),

        (Running | Paused, ControlEvent::Exited(0)) => Ok(Completed),
        (Running | Paused, ControlEvent::Exited(_)) => Ok(Failed),
        (Cancelled, ControlEvent::Exited(_)) => Ok(Cancelled),
        (Running | Paused, ControlEvent::Errored) => Ok(Failed),
        (Cancelled, ControlEvent::Errored) => Ok(Cancelled),

        (state, event) => Err(ExecutorError::Internal {
            message: format!("invalid transition from {state} on {event:?}"),
        }),
    }
}

pub fn signal_for(kind: ControlKind) -> SignalKind {
    match kind {
        ControlKind::Pause => SignalKind::Pause,
        ControlKind::Resume => SignalKind::Resume,
        ControlKind::Cancel => SignalKind::TerminateGraceful,
    }
}

/// Wire status reported for a state reached through `event`.
pub fn status_for(state: ProcessState, event: ControlEvent) -> ProcessStatus {
    match (state, event) {
        (ProcessState::Running, ControlEvent::Command(ControlKind::Resume)) => {
            ProcessStatus::Resumed
        }
        (ProcessState::Running, _) | (ProcessState::NotStarted, _) => ProcessStatus::Started,
        (ProcessState::Paused, _) => ProcessStatus::Paused,
        (ProcessState::Completed, _) => ProcessStatus::Completed,
        (ProcessState::Cancelled, _) => ProcessStatus::Cancelled,
        (ProcessState::Failed, _) => ProcessStatus::Failed,
    }
}

/// Moves a freshly spawned handle out of `NotStarted`.
pub fn start(handle: &ProcessHandle) -> Result<ProcessState, ExecutorError> {
    let mut state = handle.lock_state();
    let next = next_state(*state, ControlEvent::Spawned)?;
    *state = next;
    Ok(next)
}

/// Validates `kind` against the current state, delivers its signal and
/// records the new state. `emit` runs before the state lock is released.
pub fn apply_command<F>(
    supervisor: &Supervisor,
    handle: &ProcessHandle,
    kind: ControlKind,
    emit: F,
) -> Result<ProcessState, ExecutorError>
where
    F: FnOnce(ProcessState),
{
    let mut state = handle.lock_state();
    if handle.has_exited() {
        return Err(ExecutorError::ProcessNotFound {
            message: format!("process {} has already exited", handle.pid()),
        });
    }
    let next = next_state(*state, ControlEvent::Command(kind))?;
    supervisor.signal(handle, signal_for(kind))?;

    tracing::info!(
        pid = handle.pid(),
        from = state.as_str(),
        to = next.as_str(),
        command = kind.as_str(),
        "process state changed"
    );
    *state = next;
    emit(next);
    Ok(next)
}

/// Records the observed exit of the process.
pub fn finish<F>(handle: &ProcessHandle, exit_code: i32, emit: F) -> ProcessState
where
    F: FnOnce(ProcessState),
{
    settle(handle, ControlEvent::Exited(exit_code), emit)
}

/// Records a lifecycle failure (for example a failed wait).
pub fn fail<F>(handle: &ProcessHandle, emit: F) -> ProcessState
where
    F: FnOnce(ProcessState),
{
    settle(handle, ControlEvent::Errored, emit)
}

fn settle<F>(handle: &ProcessHandle, event: ControlEvent, emit: F) -> ProcessState
where
    F: FnOnce(ProcessState),
{
    let mut state = handle.lock_state();
    let next = match next_state(*state, event) {
        Ok(next) => next,
        Err(err) => {
            tracing::warn!(pid = handle.pid(), error = %err, "ignoring transition");
            *state
        }
    };
    if next != *state {
        tracing::info!(
            pid = handle.pid(),
            from = state.as_str(),
            to = next.as_str(),
            "process state changed"
        );
    }
    *state = next;
    emit(next);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_executor_error::ErrorType;
    use ProcessState::*;

    fn command(kind: ControlKind) -> ControlEvent {
        ControlEvent::Command(kind)
    }

    #[test]
    fn valid_transitions() {
        let cases = [
            (NotStarted, ControlEvent::Spawned, Running),
            (Running, command(ControlKind::Pause), Paused),
            (Paused, command(ControlKind::Resume), Running),
            (Running, command(ControlKind::Cancel), Cancelled),
            (Paused, command(ControlKind::Cancel), Cancelled),
            (Running, ControlEvent::Exited(0), Completed),
            (Paused, ControlEvent::Exited(0), Completed),
            (Running, ControlEvent::Exited(2), Failed),
            (Running, ControlEvent::Exited(-9), Failed),
            (Cancelled, ControlEvent::Exited(-15), Cancelled),
            (Running, ControlEvent::Errored, Failed),
        ];
        for (from, event, to) in cases {
            assert_eq!(
                next_state(from, event).expect("valid transition"),
                to,
                "{from} on {event:?}"
            );
        }
    }

    #[test]
    fn invalid_commands_name_the_state() {
        let err = next_state(Paused, command(ControlKind::Pause)).expect_err("double pause");
        assert_eq!(err.error_type(), ErrorType::InvalidState);
        assert_eq!(err.to_string(), "cannot pause a process that is paused");

        let err = next_state(Running, command(ControlKind::Resume)).expect_err("resume running");
        assert_eq!(err.error_type(), ErrorType::InvalidState);

        for terminal in [Completed, Cancelled, Failed] {
            for kind in [ControlKind::Pause, ControlKind::Resume, ControlKind::Cancel] {
                let err = next_state(terminal, command(kind)).expect_err("terminal");
                assert_eq!(err.error_type(), ErrorType::InvalidState);
            }
        }

        let err = next_state(NotStarted, command(ControlKind::Cancel)).expect_err("nothing");
        assert_eq!(err.error_type(), ErrorType::ProcessNotFound);
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(next_state(Completed, ControlEvent::Exited(0)).is_err());
        assert!(next_state(Failed, ControlEvent::Spawned).is_err());
        for state in [Completed, Cancelled, Failed] {
            assert!(state.is_terminal());
            assert!(!state.is_active());
        }
    }

    #[test]
    fn wire_statuses() {
        assert_eq!(
            status_for(Running, command(ControlKind::Resume)),
            ProcessStatus::Resumed
        );
        assert_eq!(status_for(Running, ControlEvent::Spawned), ProcessStatus::Started);
        assert_eq!(
            status_for(Cancelled, ControlEvent::Exited(-15)),
            ProcessStatus::Cancelled
        );
        assert_eq!(
            status_for(Failed, ControlEvent::Exited(1)),
            ProcessStatus::Failed
        );
    }
}
