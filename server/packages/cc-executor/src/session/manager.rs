use std::sync::Arc;
use std::time::Duration;

use cc_executor_error::ExecutorError;
use cc_executor_protocol::ControlKind;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::control;
use crate::session::{CloseReason, OutboxError, Session, SessionError, SessionTable};
use crate::supervisor::Supervisor;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);
const MAX_REAPER_PERIOD: Duration = Duration::from_secs(30);

/// Owns the session table and every lifecycle decision about sessions:
/// creation, resumption, grace-window expiry, idle reaping and teardown.
#[derive(Debug)]
pub struct SessionManager {
    table: SessionTable,
    supervisor: Arc<Supervisor>,
    config: Arc<ServerConfig>,
}

impl SessionManager {
    pub fn new(config: Arc<ServerConfig>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            table: SessionTable::new(config.max_sessions, config.max_pending_messages),
            supervisor,
            config,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.table.max_sessions()
    }

    pub async fn active_sessions(&self) -> usize {
        self.table.len().await
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.table.get(session_id).await
    }

    /// Creates a fresh session.
    pub async fn open(&self) -> Result<Arc<Session>, ExecutorError> {
        let session = self.table.create().await?;
        tracing::info!(session_id = %session.id(), "session created");
        Ok(session)
    }

    /// Looks up a session waiting for (or holding) a connection, checking
    /// its reconnection token.
    pub async fn resume(&self, session_id: &str, token: &str) -> Result<Arc<Session>, ExecutorError> {
        self.table
            .get(session_id)
            .await
            .filter(|session| session.token_matches(token))
            .ok_or_else(|| ExecutorError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Closes `session` and cancels its process, if one is still live.
    pub async fn close(&self, session: &Arc<Session>, reason: CloseReason) {
        if session.close() {
            self.teardown(session, reason).await;
        }
    }

    /// Starts the reconnection grace window for a session whose connection
    /// `epoch` was just lost.
    pub fn schedule_expiry(self: &Arc<Self>, session: Arc<Session>, epoch: u64) {
        let manager = self.clone();
        let grace = self.config.reconnect_grace;
        tracing::info!(
            session_id = %session.id(),
            grace_ms = grace.as_millis() as u64,
            queued = session.outbox().len(),
            "session disconnected; waiting for reconnect"
        );
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let disconnected_for = session.link_since().elapsed();
            if session.expire(epoch) {
                tracing::info!(
                    session_id = %session.id(),
                    disconnected_ms = disconnected_for.as_millis() as u64,
                    "reconnect grace expired"
                );
                manager.teardown(&session, CloseReason::GraceExpired).await;
            }
        });
    }

    /// Routes a failed enqueue. Overflow ends the session; a closed outbox
    /// means the session is already gone.
    pub fn on_send_error(self: &Arc<Self>, session: &Arc<Session>, err: SessionError) {
        match err {
            SessionError::Outbox(OutboxError::Overflow { capacity }) => {
                tracing::warn!(
                    session_id = %session.id(),
                    capacity,
                    "outbound queue overflowed; closing session"
                );
                let manager = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    manager.close(&session, CloseReason::QueueOverflow).await;
                });
            }
            SessionError::Outbox(OutboxError::Closed) => {}
            SessionError::Encode(err) => {
                tracing::error!(session_id = %session.id(), error = %err, "failed to encode message");
            }
        }
    }

    /// Periodically closes sessions with no requests and no live process for
    /// longer than the idle timeout.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let idle_timeout = self.config.session_idle_timeout;
        let period = (idle_timeout / 2).clamp(Duration::from_millis(100), MAX_REAPER_PERIOD);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for session in manager.table.all().await {
                    if session.last_activity().elapsed() < idle_timeout {
                        continue;
                    }
                    if session.has_live_process().await {
                        continue;
                    }
                    manager.close(&session, CloseReason::IdleTimeout).await;
                }
            }
        })
    }

    /// Closes every session and waits, bounded by the termination grace,
    /// for their processes to be reaped.
    pub async fn shutdown(&self) {
        let sessions = self.table.all().await;
        tracing::info!(sessions = sessions.len(), "closing all sessions");
        for session in &sessions {
            self.close(session, CloseReason::Shutdown).await;
        }

        let deadline = Instant::now() + self.supervisor.termination_grace() + Duration::from_secs(1);
        for session in &sessions {
            while session.has_live_process().await {
                if Instant::now() >= deadline {
                    tracing::warn!(session_id = %session.id(), "process still running at shutdown");
                    break;
                }
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
        }
    }

    async fn teardown(&self, session: &Arc<Session>, reason: CloseReason) {
        self.table.remove(session.id()).await;

        let slot = session.process().await;
        if let Some(binding) = slot.as_ref().filter(|binding| binding.is_live()) {
            match control::apply_command(&self.supervisor, &binding.handle, ControlKind::Cancel, |_| {}) {
                Ok(_) => tracing::info!(
                    session_id = %session.id(),
                    pid = binding.handle.pid(),
                    "terminating process of closed session"
                ),
                Err(err) => tracing::debug!(
                    session_id = %session.id(),
                    pid = binding.handle.pid(),
                    error = %err,
                    "process already terminating"
                ),
            }
        }
        drop(slot);

        tracing::info!(
            session_id = %session.id(),
            reason = reason.as_str(),
            age_ms = session.created_at().elapsed().as_millis() as u64,
            "session closed"
        );
    }
}
