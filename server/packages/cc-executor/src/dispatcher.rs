use std::sync::Arc;
use std::time::Duration;

use cc_executor_error::ExecutorError;
use cc_executor_protocol::{
    ClientNotification, ClientRequest, ControlKind, ControlParams, ControlResult, Envelope,
    ExecuteParams, ExecuteResult, ProcessErrorParams, ProcessStatus, Request, RequestId, Response,
    ServerNotification,
};
use serde::Serialize;

use crate::config::ServerConfig;
use crate::control::{self, ControlEvent};
use crate::execution::{status_update, Execution};
use crate::router::AppState;
use crate::session::{ProcessBinding, Session, SessionError};
use crate::stream::OutputStream;

/// Handles one inbound text frame. Every request gets exactly one response;
/// notifications and responses from the client never do.
pub(crate) async fn handle_frame(state: &Arc<AppState>, session: &Arc<Session>, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::debug!(
                session_id = %session.id(),
                id = ?err.id,
                error = %err,
                "rejected frame"
            );
            respond(state, session, err.into_response());
            return;
        }
    };

    match envelope {
        Envelope::Request(request) => {
            session.touch();
            handle_request(state, session, request).await;
        }
        Envelope::Notification(notification) => {
            match ClientNotification::from_notification(&notification) {
                Ok(Some(ClientNotification::Pong(_))) => session.record_pong(),
                Ok(None) => tracing::debug!(
                    session_id = %session.id(),
                    method = %notification.method,
                    "ignoring notification"
                ),
                Err(err) => tracing::debug!(
                    session_id = %session.id(),
                    error = %err,
                    "malformed notification"
                ),
            }
        }
        Envelope::Response(_) => {
            tracing::debug!(session_id = %session.id(), "ignoring client response");
        }
    }
}

/// Answers a frame the transport delivered in a form the protocol does not
/// accept (binary data).
pub(crate) fn reject_frame(state: &Arc<AppState>, session: &Arc<Session>, message: &str) {
    let err = ExecutorError::InvalidRequest {
        message: message.to_string(),
    };
    respond(state, session, Response::error(None, err));
}

async fn handle_request(state: &Arc<AppState>, session: &Arc<Session>, request: Request) {
    let call = match ClientRequest::from_request(&request) {
        Ok(call) => call,
        Err(err) => {
            respond(state, session, Response::error(Some(request.id), err));
            return;
        }
    };

    let id = request.id;
    let outcome = match call {
        ClientRequest::Execute(params) => execute(state, session, &id, params).await,
        ClientRequest::Control(params) => control(state, session, &id, params).await,
    };
    if let Err(err) = outcome {
        tracing::debug!(
            session_id = %session.id(),
            method = %request.method,
            code = err.code(),
            error = %err,
            "request failed"
        );
        respond(state, session, Response::error(Some(id), err));
    }
}

async fn execute(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    id: &RequestId,
    params: ExecuteParams,
) -> Result<(), ExecutorError> {
    let mut slot = session.process().await;
    if let Some(binding) = slot.as_ref().filter(|binding| binding.is_live()) {
        return Err(ExecutorError::ProcessAlreadyRunning {
            pid: binding.handle.pid(),
        });
    }

    let spawned = match state.supervisor().spawn(&params.command) {
        Ok(spawned) => spawned,
        Err(err @ ExecutorError::SpawnFailed { .. }) => {
            respond(state, session, Response::error(Some(id.clone()), &err));
            notify(
                state,
                session,
                ServerNotification::ProcessError(ProcessErrorParams {
                    code: err.code(),
                    message: err.to_string(),
                    pid: None,
                    pgid: None,
                }),
            );
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let handle = spawned.handle;
    let output = OutputStream::start(spawned.stdout, spawned.stderr, state.config().max_line_size);
    let threshold = stall_threshold(state.config(), params.timeout);

    respond_result(
        state,
        session,
        id,
        &ExecuteResult {
            status: ProcessStatus::Started,
            pid: handle.pid(),
            pgid: handle.pgid(),
        },
    );
    notify(
        state,
        session,
        ServerNotification::ProcessStarted(status_update(&handle, ProcessStatus::Started, None)),
    );
    tracing::info!(
        session_id = %session.id(),
        pid = handle.pid(),
        pgid = handle.pgid(),
        command = %params.command,
        stall_threshold_ms = threshold.map(|t| t.as_millis() as u64),
        "execution started"
    );

    let execution = Execution::new(
        state.clone(),
        session.clone(),
        handle.clone(),
        spawned.child,
        output,
        threshold,
    );
    let driver = tokio::spawn(execution.run());
    *slot = Some(ProcessBinding { handle, driver });
    Ok(())
}

async fn control(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    id: &RequestId,
    params: ControlParams,
) -> Result<(), ExecutorError> {
    let handle = session
        .process()
        .await
        .as_ref()
        .filter(|binding| binding.is_live())
        .map(|binding| binding.handle.clone())
        .ok_or_else(|| ExecutorError::ProcessNotFound {
            message: "no process is running in this session".to_string(),
        })?;

    let kind = params.kind;
    let result = control::apply_command(state.supervisor(), &handle, kind, |next| {
        let status = control::status_for(next, ControlEvent::Command(kind));
        respond_result(state, session, id, &ControlResult { status });
        let update = status_update(&handle, status, None);
        let notification = match kind {
            ControlKind::Pause => ServerNotification::ProcessPaused(update),
            ControlKind::Resume => ServerNotification::ProcessResumed(update),
            ControlKind::Cancel => ServerNotification::ProcessCancelled(update),
        };
        notify(state, session, notification);
    });

    match result {
        Ok(_) => Ok(()),
        Err(err @ ExecutorError::Internal { .. }) => {
            // The signal could not be delivered; the process is no longer
            // under control.
            control::fail(&handle, |_| {
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
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// `timeout: 0` disables stall detection for the execution; any other value
/// replaces the server default.
fn stall_threshold(config: &ServerConfig, timeout: Option<u64>) -> Option<Duration> {
    match timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.stream_timeout,
    }
}

fn respond_result<T: Serialize>(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    id: &RequestId,
    result: &T,
) {
    match serde_json::to_value(result) {
        Ok(value) => respond(state, session, Response::result(id.clone(), value)),
        Err(err) => respond(
            state,
            session,
            Response::error(
                Some(id.clone()),
                ExecutorError::Internal {
                    message: err.to_string(),
                },
            ),
        ),
    }
}

fn respond(state: &Arc<AppState>, session: &Arc<Session>, response: Response) {
    if let Err(err) = session.send_response(response) {
        report(state, session, err);
    }
}

fn notify(state: &Arc<AppState>, session: &Arc<Session>, notification: ServerNotification) {
    if let Err(err) = session.send_notification(&notification) {
        report(state, session, err);
    }
}

fn report(state: &Arc<AppState>, session: &Arc<Session>, err: SessionError) {
    state.sessions().on_send_error(session, err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_request_timeout_overrides_the_default() {
        let config = ServerConfig {
            stream_timeout: Some(Duration::from_secs(600)),
            ..ServerConfig::default()
        };
        assert_eq!(
            stall_threshold(&config, None),
            Some(Duration::from_secs(600))
        );
        assert_eq!(stall_threshold(&config, Some(5)), Some(Duration::from_secs(5)));
        assert_eq!(stall_threshold(&config, Some(0)), None);

        let disabled = ServerConfig {
            stream_timeout: None,
            ..ServerConfig::default()
        };
        assert_eq!(stall_threshold(&disabled, None), None);
        assert_eq!(stall_threshold(&disabled, Some(2)), Some(Duration::from_secs(2)));
    }
}
