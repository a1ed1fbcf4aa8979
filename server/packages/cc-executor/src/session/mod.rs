use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cc_executor_error::ExecutorError;
use cc_executor_protocol::{Envelope, Response, ServerNotification};
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::supervisor::ProcessHandle;

pub mod connection;
pub mod manager;
pub mod outbox;

pub use manager::SessionManager;
pub use outbox::{Outbox, OutboxError, PendingMessage};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    GraceExpired,
    IdleTimeout,
    QueueOverflow,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::GraceExpired => "grace_expired",
            Self::IdleTimeout => "idle_timeout",
            Self::QueueOverflow => "queue_overflow",
            Self::Shutdown => "shutdown",
        }
    }
}

/// The process bound to a session together with the task driving it.
#[derive(Debug)]
pub struct ProcessBinding {
    pub handle: Arc<ProcessHandle>,
    pub driver: JoinHandle<()>,
}

impl ProcessBinding {
    /// True until the driver has observed the exit and reported it.
    pub fn is_live(&self) -> bool {
        !self.handle.is_reported() && !self.driver.is_finished()
    }
}

/// Handed to the connection that just attached.
#[derive(Debug)]
pub struct Attachment {
    pub epoch: u64,
    pub resumed: bool,
    pub replayed: usize,
    /// Fires when another connection takes over or the session closes.
    pub displaced: oneshot::Receiver<()>,
}

#[derive(Debug)]
struct Link {
    state: LinkState,
    epoch: u64,
    since: Instant,
    displace: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    reconnect_token: String,
    created_at: Instant,
    outbox: Outbox,
    link: Mutex<Link>,
    last_pong: Mutex<Instant>,
    last_activity: Mutex<Instant>,
    process: tokio::sync::Mutex<Option<ProcessBinding>>,
}

impl Session {
    pub fn new(max_pending_messages: usize) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            reconnect_token: Uuid::new_v4().simple().to_string(),
            created_at: now,
            outbox: Outbox::new(max_pending_messages),
            link: Mutex::new(Link {
                state: LinkState::Disconnected,
                epoch: 0,
                since: now,
                displace: None,
            }),
            last_pong: Mutex::new(now),
            last_activity: Mutex::new(now),
            process: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reconnect_token(&self) -> &str {
        &self.reconnect_token
    }

    pub fn token_matches(&self, token: &str) -> bool {
        let expected = self.reconnect_token.as_bytes();
        let given = token.as_bytes();
        expected.len() == given.len()
            && expected
                .iter()
                .zip(given)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link_state(&self) -> LinkState {
        self.link().state
    }

    /// When the session entered its current [`LinkState`].
    pub fn link_since(&self) -> Instant {
        self.link().since
    }

    /// Binds a new connection, displacing the current one if any.
    pub fn attach(&self) -> Result<Attachment, ExecutorError> {
        let mut link = self.link();
        if link.state == LinkState::Closed {
            return Err(ExecutorError::SessionNotFound {
                session_id: self.id.clone(),
            });
        }
        if let Some(previous) = link.displace.take() {
            let _ = previous.send(());
        }
        let (displace, displaced) = oneshot::channel();
        link.epoch += 1;
        link.state = LinkState::Connected;
        link.since = Instant::now();
        link.displace = Some(displace);
        let epoch = link.epoch;
        drop(link);

        self.record_pong();
        Ok(Attachment {
            epoch,
            resumed: epoch > 1,
            replayed: self.outbox.len(),
            displaced,
        })
    }

    /// Returns true when `epoch` was the live connection and the session now
    /// waits for a reconnect.
    pub fn detach(&self, epoch: u64) -> bool {
        let mut link = self.link();
        if link.state != LinkState::Connected || link.epoch != epoch {
            return false;
        }
        link.state = LinkState::Disconnected;
        link.since = Instant::now();
        link.displace = None;
        true
    }

    pub fn is_awaiting_reconnect(&self, epoch: u64) -> bool {
        let link = self.link();
        link.state == LinkState::Disconnected && link.epoch == epoch
    }

    /// Closes the session only if it is still waiting for the reconnect that
    /// `epoch` was detached from.
    pub fn expire(&self, epoch: u64) -> bool {
        let link = self.link();
        if link.state != LinkState::Disconnected || link.epoch != epoch {
            return false;
        }
        self.close_locked(link);
        true
    }

    /// Marks the session closed and releases its connection. Returns false if
    /// it was already closed.
    pub fn close(&self) -> bool {
        let link = self.link();
        if link.state == LinkState::Closed {
            return false;
        }
        self.close_locked(link);
        true
    }

    fn close_locked(&self, mut link: MutexGuard<'_, Link>) {
        link.state = LinkState::Closed;
        link.since = Instant::now();
        // The writer must see a closed outbox once it is displaced.
        self.outbox.close();
        if let Some(displace) = link.displace.take() {
            let _ = displace.send(());
        }
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn send_notification(&self, notification: &ServerNotification) -> Result<u64, SessionError> {
        let envelope = Envelope::from(notification.to_notification()?);
        Ok(self.outbox.push(envelope.to_text())?)
    }

    pub fn send_response(&self, response: Response) -> Result<u64, SessionError> {
        Ok(self.outbox.push(Envelope::from(response).to_text())?)
    }

    pub async fn process(&self) -> tokio::sync::MutexGuard<'_, Option<ProcessBinding>> {
        self.process.lock().await
    }

    pub async fn has_live_process(&self) -> bool {
        self.process
            .lock()
            .await
            .as_ref()
            .is_some_and(ProcessBinding::is_live)
    }
}

/// Every session known to the server, connected or waiting for a reconnect.
#[derive(Debug)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    max_pending_messages: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize, max_pending_messages: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            max_pending_messages,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub async fn create(&self) -> Result<Arc<Session>, ExecutorError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(ExecutorError::SessionLimitExceeded {
                active: sessions.len(),
                max: self.max_sessions,
            });
        }
        let session = Arc::new(Session::new(self.max_pending_messages));
        sessions.insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_executor_error::ErrorType;
    use cc_executor_protocol::{PingParams, RequestId};

    #[tokio::test]
    async fn table_enforces_the_session_limit() {
        let table = SessionTable::new(2, 16);
        let first = table.create().await.expect("first");
        table.create().await.expect("second");
        let err = table.create().await.expect_err("limit");
        assert_eq!(err.error_type(), ErrorType::SessionLimitExceeded);

        table.remove(first.id()).await.expect("removed");
        table.create().await.expect("slot freed");
        assert_eq!(table.len().await, 2);
    }

    #[test]
    fn attach_detach_and_displacement() {
        let session = Session::new(16);
        let mut first = session.attach().expect("attach");
        assert_eq!(first.epoch, 1);
        assert!(!first.resumed);

        let second = session.attach().expect("reattach");
        assert!(second.resumed);
        assert_eq!(first.displaced.try_recv(), Ok(()));

        assert!(!session.detach(first.epoch), "stale connection cannot detach");
        let attached_since = session.link_since();
        assert!(session.detach(second.epoch));
        assert!(session.link_since() >= attached_since);
        assert!(session.is_awaiting_reconnect(second.epoch));
        assert_eq!(session.link_state(), LinkState::Disconnected);
        assert!(!session.expire(first.epoch), "only the detached epoch expires");

        let third = session.attach().expect("reconnect");
        assert!(session.detach(third.epoch));
        assert!(session.expire(third.epoch));
        assert_eq!(session.link_state(), LinkState::Closed);
        assert!(!session.close());
        let err = session.attach().expect_err("closed");
        assert_eq!(err.error_type(), ErrorType::SessionNotFound);
        assert!(session.outbox().is_closed());
    }

    #[test]
    fn queued_messages_are_counted_for_replay() {
        let session = Session::new(16);
        session
            .send_notification(&ServerNotification::Ping(PingParams {
                timestamp: "now".to_string(),
            }))
            .expect("queue");
        session
            .send_response(Response::result(
                RequestId::Number(1),
                serde_json::json!({ "ok": true }),
            ))
            .expect("queue");
        let attachment = session.attach().expect("attach");
        assert_eq!(attachment.replayed, 2);

        let first = session.outbox().try_pop().expect("first");
        let value: serde_json::Value = serde_json::from_str(&first.payload).expect("json");
        assert_eq!(value["method"], "ping");
    }

    #[test]
    fn tokens_compare_exactly() {
        let session = Session::new(1);
        let token = session.reconnect_token().to_string();
        assert!(session.token_matches(&token));
        assert!(!session.token_matches(&token[1..]));
        assert!(!session.token_matches("wrong"));
    }
}
