//! Client node for full-duplex transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardlink_core::{Action, AsyncClientEndpoint, Message, MessageHandler, Node, NodeError};
use dashmap::DashMap;

use crate::options::NodeOptions;
use crate::session::{SessionManager, SessionState};

/// Client endpoint of an asynchronous transport (e.g. a WebSocket link).
///
/// Performs an explicit open/close handshake per logical session and relies
/// on the transport's callbacks to complete every suspended operation. The
/// embedding application must invoke [`on_open`](Self::on_open),
/// [`on_message`](Self::on_message), [`on_close`](Self::on_close) and
/// [`on_error`](Self::on_error) from its receive loop.
pub struct AsyncClientNode {
    node_id: String,
    endpoint: Arc<dyn AsyncClientEndpoint>,
    handler: Arc<dyn MessageHandler>,
    sessions: DashMap<String, Arc<SessionManager>>,
    timeout: Duration,
}

impl AsyncClientNode {
    /// Create a client node over `endpoint`, delivering unsolicited inbound
    /// messages to `handler`.
    #[must_use]
    pub fn new(
        endpoint: Arc<dyn AsyncClientEndpoint>,
        handler: Arc<dyn MessageHandler>,
        options: &NodeOptions,
    ) -> Self {
        Self {
            node_id: options.id_generator.generate(),
            endpoint,
            handler,
            sessions: DashMap::new(),
            timeout: options.timeout,
        }
    }

    /// Open a logical session and suspend until the transport confirms it.
    ///
    /// # Errors
    /// Fails with `ProtocolViolation` when the session is already opening,
    /// `Timeout` when the transport never confirms, or `Communication` when
    /// the transport reports a failure.
    pub async fn open_session(&self, session_id: &str) -> Result<(), NodeError> {
        let manager = Arc::clone(
            &self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionManager::new(session_id, self.timeout))),
        );
        manager.begin_from(SessionState::OpenSessionBegin, &[SessionState::Initialized])?;
        if let Err(e) = self.endpoint.open_session(session_id).await {
            return Err(manager.fail(e.to_string()));
        }
        manager.wait_for_state(SessionState::OpenSessionEnd).await
    }

    /// Close a logical session and suspend until the transport confirms it.
    ///
    /// An aborted session is torn down locally without contacting the
    /// transport.
    ///
    /// # Errors
    /// Fails with `ClosedSession` when the session id is unknown.
    pub async fn close_session(&self, session_id: &str) -> Result<(), NodeError> {
        let manager = self
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| NodeError::ClosedSession(session_id.to_string()))?;

        if manager.is_defunct() {
            self.sessions.remove(session_id);
            return Ok(());
        }

        manager.begin(SessionState::CloseSessionBegin)?;
        if let Err(e) = self.endpoint.close_session(session_id).await {
            self.sessions.remove(session_id);
            return Err(manager.fail(e.to_string()));
        }
        let result = manager.wait_for_state(SessionState::CloseSessionEnd).await;
        self.sessions.remove(session_id);
        result
    }

    fn session(&self, session_id: &str) -> Result<Arc<SessionManager>, NodeError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| NodeError::ClosedSession(session_id.to_string()))
    }

    fn dispatch_to_handler(&self, message: Message) {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move { handler.on_message(message).await });
    }

    /// Transport callback: the session opened on the remote side.
    pub fn on_open(&self, session_id: &str) {
        match self.sessions.get(session_id) {
            Some(manager) => manager.set_state(SessionState::OpenSessionEnd),
            None => tracing::warn!(session_id, "open confirmation for unknown session"),
        }
    }

    /// Transport callback: the session closed on the remote side.
    pub fn on_close(&self, session_id: &str) {
        match self.sessions.get(session_id) {
            Some(manager) => manager.set_state(SessionState::CloseSessionEnd),
            None => tracing::warn!(session_id, "close confirmation for unknown session"),
        }
    }

    /// Transport callback: a message arrived.
    ///
    /// Pushed events go straight to the handler, even while a request is
    /// waiting; an `ERROR` action aborts the session it names; anything else
    /// either completes the pending request or reaches the handler as an
    /// unsolicited message.
    pub fn on_message(&self, message: Message) {
        match &message.action {
            action if action.is_event() => self.dispatch_to_handler(message),
            Action::Error => match self.sessions.get(&message.session_id) {
                Some(manager) => {
                    manager.on_error(format!("remote endpoint reported: {}", message.body));
                }
                None => {
                    tracing::warn!(
                        session_id = %message.session_id,
                        "ERROR message for unknown session discarded"
                    );
                }
            },
            _ => {
                let Ok(manager) = self.session(&message.session_id) else {
                    tracing::warn!(
                        session_id = %message.session_id,
                        action = %message.action,
                        "message for unknown session discarded"
                    );
                    return;
                };
                if let Some(message) = manager.try_complete_request(message) {
                    match manager.record_unsolicited(SessionState::OnMessage) {
                        Ok(()) => self.dispatch_to_handler(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "inbound message discarded");
                        }
                    }
                }
            }
        }
    }

    /// Transport callback: the transport failed for one session.
    pub fn on_error(&self, session_id: &str, detail: &str) {
        match self.sessions.get(session_id) {
            Some(manager) => manager.on_error(detail),
            None => tracing::warn!(session_id, detail, "error for unknown session"),
        }
    }
}

#[async_trait]
impl Node for AsyncClientNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn send_request(&self, mut message: Message) -> Result<Message, NodeError> {
        let manager = self.session(&message.session_id)?;
        message.client_node_id = self.node_id.clone();

        manager.begin(SessionState::SendRequestBegin)?;
        if let Err(e) = self.endpoint.send_message(message).await {
            return Err(manager.fail(e.to_string()));
        }
        manager.wait_for_reply().await
    }

    async fn send_message(&self, mut message: Message) -> Result<(), NodeError> {
        let manager = self.session(&message.session_id)?;
        message.client_node_id = self.node_id.clone();

        manager.mark_send_message()?;
        if let Err(e) = self.endpoint.send_message(message).await {
            return Err(manager.fail(e.to_string()));
        }
        Ok(())
    }
}
