//! Server node for full-duplex transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardlink_core::{Action, AsyncServerEndpoint, Message, MessageHandler, Node, NodeError};
use dashmap::DashMap;

use crate::options::NodeOptions;
use crate::session::{SessionManager, SessionState};

/// Server endpoint of an asynchronous transport.
///
/// Sessions are created lazily on the first inbound message for an unseen
/// session id and removed when the transport signals the session closed; the
/// client side owns the open/close handshake.
pub struct AsyncServerNode {
    node_id: String,
    endpoint: Arc<dyn AsyncServerEndpoint>,
    handler: Arc<dyn MessageHandler>,
    sessions: DashMap<String, Arc<SessionManager>>,
    timeout: Duration,
}

impl AsyncServerNode {
    /// Create a server node over `endpoint`, delivering unsolicited inbound
    /// messages to `handler`.
    #[must_use]
    pub fn new(
        endpoint: Arc<dyn AsyncServerEndpoint>,
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

    /// Transport callback: a message arrived.
    ///
    /// A message for an unseen session id creates its manager on the spot.
    pub fn on_message(&self, message: Message) {
        if message.session_id.is_empty() {
            tracing::warn!(action = %message.action, "message without session id discarded");
            return;
        }
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
                let manager = Arc::clone(
                    &self
                        .sessions
                        .entry(message.session_id.clone())
                        .or_insert_with(|| {
                            Arc::new(SessionManager::new(&message.session_id, self.timeout))
                        }),
                );
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

    /// Transport callback: the client closed the session.
    pub fn on_close(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_none() {
            tracing::debug!(session_id, "close signal for unknown session");
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
impl Node for AsyncServerNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn send_request(&self, mut message: Message) -> Result<Message, NodeError> {
        let manager = self.session(&message.session_id)?;
        message.server_node_id = self.node_id.clone();

        manager.begin(SessionState::SendRequestBegin)?;
        if let Err(e) = self.endpoint.send_message(message).await {
            return Err(manager.fail(e.to_string()));
        }
        manager.wait_for_reply().await
    }

    async fn send_message(&self, mut message: Message) -> Result<(), NodeError> {
        let manager = self.session(&message.session_id)?;
        message.server_node_id = self.node_id.clone();

        manager.mark_send_message()?;
        if let Err(e) = self.endpoint.send_message(message).await {
            return Err(manager.fail(e.to_string()));
        }
        Ok(())
    }
}
