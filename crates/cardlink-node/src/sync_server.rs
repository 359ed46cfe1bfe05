//! Server node for request/response transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardlink_core::{Action, Message, MessageHandler, Node, NodeError};
use dashmap::DashMap;

use crate::events::ServerPushEventManager;
use crate::options::NodeOptions;
use crate::session::{SessionManager, SessionState};

/// Server endpoint of a synchronous transport (e.g. behind an HTTP handler).
///
/// The transport cannot push: every byte that reaches the client travels in
/// the reply set of one of the client's own calls. [`on_request`](Self::on_request)
/// is therefore the single entry point; server-initiated requests are tunneled
/// through the client's next poll, and pushed events wait in per-client
/// mailboxes drained by `CHECK_PLUGIN_EVENT`/`CHECK_READER_EVENT` calls.
pub struct SyncServerNode {
    node_id: String,
    handler: Arc<dyn MessageHandler>,
    sessions: DashMap<String, Arc<SessionManager>>,
    plugin_events: DashMap<String, Arc<ServerPushEventManager>>,
    reader_events: DashMap<String, Arc<ServerPushEventManager>>,
    timeout: Duration,
}

impl SyncServerNode {
    /// Create a server node delivering inbound calls to `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn MessageHandler>, options: &NodeOptions) -> Self {
        Self {
            node_id: options.id_generator.generate(),
            handler,
            sessions: DashMap::new(),
            plugin_events: DashMap::new(),
            reader_events: DashMap::new(),
            timeout: options.timeout,
        }
    }

    /// Process one inbound transport call and build its reply set.
    ///
    /// Event check calls drain the caller's mailbox (long polling per the
    /// negotiated strategy). Any other call either answers a pending
    /// server-initiated request or reaches the handler as a fresh exchange;
    /// the call then suspends until the handler produces output for it.
    ///
    /// # Errors
    /// `Timeout` is fatal for the session: the entry is removed, because the
    /// transport exchange cannot be retried after the fact.
    pub async fn on_request(&self, message: Message) -> Result<Vec<Message>, NodeError> {
        match &message.action {
            Action::CheckPluginEvent => self.check_events(&self.plugin_events, &message).await,
            Action::CheckReaderEvent => self.check_events(&self.reader_events, &message).await,
            _ => self.on_session_request(message).await,
        }
    }

    async fn check_events(
        &self,
        mailboxes: &DashMap<String, Arc<ServerPushEventManager>>,
        message: &Message,
    ) -> Result<Vec<Message>, NodeError> {
        if message.client_node_id.is_empty() {
            return Err(NodeError::ProtocolViolation(
                "event check without client node id".to_string(),
            ));
        }
        let mailbox = Arc::clone(
            &mailboxes
                .entry(message.client_node_id.clone())
                .or_insert_with(|| Arc::new(ServerPushEventManager::new())),
        );
        mailbox.check(message).await
    }

    async fn on_session_request(&self, message: Message) -> Result<Vec<Message>, NodeError> {
        if message.session_id.is_empty() {
            return Err(NodeError::ProtocolViolation(
                "message without session id".to_string(),
            ));
        }
        let manager = Arc::clone(
            &self
                .sessions
                .entry(message.session_id.clone())
                .or_insert_with(|| {
                    Arc::new(SessionManager::new(&message.session_id, self.timeout))
                }),
        );

        // Either this call carries the reply to a tunneled server request,
        // or it is a fresh exchange for the handler to process.
        if let Some(message) = manager.try_complete_request(message) {
            manager.accept_request()?;
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move { handler.on_message(message).await });
        }

        match manager.wait_outbox().await {
            Ok(replies) => {
                manager.reset_if_idle();
                Ok(replies)
            }
            Err(err) => {
                self.sessions.remove(manager.session_id());
                tracing::warn!(
                    session_id = manager.session_id(),
                    error = %err,
                    "sync exchange failed; session removed"
                );
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Node for SyncServerNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Push a request to the client by tunneling it through the client's next
    /// ordinary call.
    ///
    /// Concurrent server-initiated requests on one session are serialized: a
    /// second call waits for the in-flight exchange to complete.
    async fn send_request(&self, mut message: Message) -> Result<Message, NodeError> {
        let manager = self
            .sessions
            .get(&message.session_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| NodeError::ClosedSession(message.session_id.clone()))?;
        message.server_node_id = self.node_id.clone();

        manager.begin_request_queued(message).await?;
        match manager.wait_for_reply().await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                // The transport exchange cannot be recovered after the fact.
                self.sessions.remove(manager.session_id());
                Err(err)
            }
        }
    }

    /// Queue a message into the pending call's reply set, or post an event
    /// into the addressed client's mailbox.
    async fn send_message(&self, mut message: Message) -> Result<(), NodeError> {
        message.server_node_id = self.node_id.clone();

        if message.action.is_event() {
            if message.client_node_id.is_empty() {
                return Err(NodeError::ProtocolViolation(
                    "pushed event without client node id".to_string(),
                ));
            }
            let mailboxes = if message.action == Action::PluginEvent {
                &self.plugin_events
            } else {
                &self.reader_events
            };
            let mailbox = Arc::clone(
                &mailboxes
                    .entry(message.client_node_id.clone())
                    .or_insert_with(|| Arc::new(ServerPushEventManager::new())),
            );
            mailbox.post(message);
            return Ok(());
        }

        let manager = self
            .sessions
            .get(&message.session_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| NodeError::ClosedSession(message.session_id.clone()))?;
        manager.post_reply(message)
    }
}
