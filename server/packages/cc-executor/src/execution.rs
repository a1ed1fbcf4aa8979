use std::sync::Arc;
use std::time::Duration;

use cc_executor_error::ExecutorError;
use cc_executor_protocol::{
    ControlKind, ProcessErrorParams, ProcessStatus, ServerNotification, StatusUpdate,
};
use tokio::process::Child;
use tokio::time::{Instant, MissedTickBehavior};

use crate::control::{self, ControlEvent, ProcessState};
use crate::router::AppState;
use crate::session::Session;
use crate::stream::{OutputChunk, OutputStream, StallDetector};
use crate::supervisor::ProcessHandle;

const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Drives one process from spawn to its exit notification: forwards output,
/// watches for stalls, reaps the child and reports how it ended.
pub(crate) struct Execution {
    state: Arc<AppState>,
    session: Arc<Session>,
    handle: Arc<ProcessHandle>,
    child: Child,
    output: OutputStream,
    stall: Option<StallDetector>,
}

impl Execution {
    pub(crate) fn new(
        state: Arc<AppState>,
        session: Arc<Session>,
        handle: Arc<ProcessHandle>,
        child: Child,
        output: OutputStream,
        stall_threshold: Option<Duration>,
    ) -> Self {
        let stall = stall_threshold.map(|threshold| StallDetector::new(threshold, Instant::now()));
        Self {
            state,
            session,
            handle,
            child,
            output,
            stall,
        }
    }

    pub(crate) async fn run(self) {
        let Self {
            state,
            session,
            handle,
            mut child,
            mut output,
            mut stall,
        } = self;

        let supervisor = state.supervisor().clone();
        let wait = supervisor.wait(&handle, &mut child);
        tokio::pin!(wait);

        let tick = stall
            .as_ref()
            .map(StallDetector::poll_interval)
            .unwrap_or(IDLE_TICK);
        let mut stall_tick = tokio::time::interval(tick);
        stall_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut exit: Option<Result<i32, ExecutorError>> = None;
        let mut output_open = true;
        let mut drain_deadline: Option<Instant> = None;

        let result = loop {
            if !output_open {
                if let Some(result) = exit.take() {
                    break result;
                }
            }
            let drain_at = drain_deadline.unwrap_or_else(|| Instant::now() + IDLE_TICK);

            tokio::select! {
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => {
                        if let Some(stall) = stall.as_mut() {
                            stall.record_activity(Instant::now());
                        }
                        forward(&state, &session, &handle, chunk);
                    }
                    None => output_open = false,
                },
                result = &mut wait, if exit.is_none() && drain_deadline.is_none() => {
                    exit = Some(result);
                    drain_deadline = Some(Instant::now() + state.config().drain_timeout);
                }
                _ = stall_tick.tick(), if stall.is_some() && !handle.has_exited() => {
                    if let Some(stall) = stall.as_mut() {
                        check_stall(&state, &session, &handle, stall);
                    }
                }
                _ = tokio::time::sleep_until(drain_at), if drain_deadline.is_some() && output_open => {
                    tracing::warn!(
                        pid = handle.pid(),
                        "output pipes still open after exit; abandoning readers"
                    );
                    output.abort();
                    output_open = false;
                }
            }
        };

        report_exit(&state, &session, &handle, result);
    }
}

fn forward(state: &Arc<AppState>, session: &Arc<Session>, handle: &ProcessHandle, chunk: OutputChunk) {
    handle.record_output(chunk.len());
    let notification = ServerNotification::ProcessOutput(chunk.to_params());
    if let Err(err) = session.send_notification(&notification) {
        state.sessions().on_send_error(session, err);
    }
}

fn check_stall(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    handle: &ProcessHandle,
    stall: &mut StallDetector,
) {
    let now = Instant::now();
    stall.set_paused(handle.state() == ProcessState::Paused, now);
    let Some(silent) = stall.check(now) else {
        return;
    };

    let err = ExecutorError::StreamTimeout {
        elapsed_ms: silent.as_millis() as u64,
    };
    tracing::warn!(
        session_id = %session.id(),
        pid = handle.pid(),
        silent_ms = silent.as_millis() as u64,
        threshold_ms = stall.threshold().as_millis() as u64,
        "process output stalled"
    );
    notify(
        state,
        session,
        ServerNotification::ProcessError(ProcessErrorParams {
            code: err.code(),
            message: err.to_string(),
            pid: Some(handle.pid()),
            pgid: Some(handle.pgid()),
        }),
    );

    if !state.config().cancel_on_stall {
        return;
    }
    let result = control::apply_command(state.supervisor(), handle, ControlKind::Cancel, |next| {
        notify(
            state,
            session,
            ServerNotification::ProcessCancelled(status_update(
                handle,
                control::status_for(next, ControlEvent::Command(ControlKind::Cancel)),
                None,
            )),
        );
    });
    if let Err(err) = result {
        tracing::debug!(pid = handle.pid(), error = %err, "stall cancel skipped");
    }
}

fn report_exit(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    handle: &ProcessHandle,
    result: Result<i32, ExecutorError>,
) {
    handle.mark_reported();
    match result {
        Ok(code) => {
            control::finish(handle, code, |next| {
                let status = control::status_for(next, ControlEvent::Exited(code));
                notify(
                    state,
                    session,
                    ServerNotification::ProcessCompleted(status_update(handle, status, Some(code))),
                );
            });
            tracing::info!(
                session_id = %session.id(),
                pid = handle.pid(),
                exit_code = code,
                state = handle.state().as_str(),
                output_bytes = handle.output_bytes(),
                "execution finished"
            );
        }
        Err(err) => {
            control::fail(handle, |_| {
                notify(
                    state,
                    session,
                    ServerNotification::ProcessError(ProcessErrorParams {
                        code: err.code(),
                        message: err.to_string(),
                        pid: Some(handle.pid()),
                        pgid: Some(handle.pgid()),
                    }),
                );
            });
            tracing::error!(
                session_id = %session.id(),
                pid = handle.pid(),
                error = %err,
                "execution failed"
            );
        }
    }
}

pub(crate) fn status_update(
    handle: &ProcessHandle,
    status: ProcessStatus,
    exit_code: Option<i32>,
) -> StatusUpdate {
    StatusUpdate {
        status,
        pid: Some(handle.pid()),
        pgid: Some(handle.pgid()),
        exit_code,
        error: None,
    }
}

fn notify(state: &Arc<AppState>, session: &Arc<Session>, notification: ServerNotification) {
    if let Err(err) = session.send_notification(&notification) {
        state.sessions().on_send_error(session, err);
    }
}
