//! In-process endpoint implementations.

use std::sync::Arc;

use async_trait::async_trait;
use cardlink_core::{
    AsyncClientEndpoint, AsyncServerEndpoint, Message, MessageHandler, SyncClientEndpoint,
    TransportError,
};
use cardlink_node::{AsyncClientNode, AsyncServerNode, NodeOptions, SyncServerNode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sync client endpoint that routes each request straight into a
/// [`SyncServerNode`] living in the same process.
pub struct MemorySyncEndpoint {
    server: Arc<SyncServerNode>,
}

impl MemorySyncEndpoint {
    /// Bind the endpoint to a local server node.
    #[must_use]
    pub fn new(server: Arc<SyncServerNode>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl SyncClientEndpoint for MemorySyncEndpoint {
    async fn send_request(&self, message: Message) -> Result<Vec<Message>, TransportError> {
        self.server
            .on_request(message)
            .await
            .map_err(|e| TransportError::new(e.to_string()))
    }
}

enum LinkEvent {
    Open(String),
    Message(Message),
    Close(String),
}

struct ChannelClientEndpoint {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

#[async_trait]
impl AsyncClientEndpoint for ChannelClientEndpoint {
    async fn open_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.tx
            .send(LinkEvent::Open(session_id.to_string()))
            .map_err(|_| TransportError::new("link closed"))
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(LinkEvent::Message(message))
            .map_err(|_| TransportError::new("link closed"))
    }

    async fn close_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.tx
            .send(LinkEvent::Close(session_id.to_string()))
            .map_err(|_| TransportError::new("link closed"))
    }
}

struct ChannelServerEndpoint {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl AsyncServerEndpoint for ChannelServerEndpoint {
    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::new("link closed"))
    }
}

/// A connected async client/server node pair exchanging messages over
/// in-process channels.
///
/// The pump tasks stop when the link is dropped.
pub struct MemoryAsyncLink {
    /// Client node of the link.
    pub client: Arc<AsyncClientNode>,
    /// Server node of the link.
    pub server: Arc<AsyncServerNode>,
    pumps: Vec<JoinHandle<()>>,
}

impl MemoryAsyncLink {
    /// Build both nodes and start pumping messages between them.
    #[must_use]
    pub fn connect(
        client_handler: Arc<dyn MessageHandler>,
        server_handler: Arc<dyn MessageHandler>,
        options: &NodeOptions,
    ) -> Self {
        let (c2s_tx, mut c2s_rx) = mpsc::unbounded_channel();
        let (s2c_tx, mut s2c_rx) = mpsc::unbounded_channel();

        let client = Arc::new(AsyncClientNode::new(
            Arc::new(ChannelClientEndpoint { tx: c2s_tx }),
            client_handler,
            options,
        ));
        let server = Arc::new(AsyncServerNode::new(
            Arc::new(ChannelServerEndpoint { tx: s2c_tx }),
            server_handler,
            options,
        ));

        let mut pumps = Vec::new();
        pumps.push(tokio::spawn({
            let client = Arc::clone(&client);
            let server = Arc::clone(&server);
            async move {
                while let Some(event) = c2s_rx.recv().await {
                    match event {
                        // The link is local: an open is established the
                        // moment it is requested, the server learns the
                        // session lazily from its first message.
                        LinkEvent::Open(session_id) => client.on_open(&session_id),
                        LinkEvent::Message(message) => server.on_message(message),
                        LinkEvent::Close(session_id) => {
                            server.on_close(&session_id);
                            client.on_close(&session_id);
                        }
                    }
                }
                tracing::debug!("client-to-server pump stopped");
            }
        }));
        pumps.push(tokio::spawn({
            let client = Arc::clone(&client);
            async move {
                while let Some(message) = s2c_rx.recv().await {
                    client.on_message(message);
                }
                tracing::debug!("server-to-client pump stopped");
            }
        }));

        Self {
            client,
            server,
            pumps,
        }
    }
}

impl Drop for MemoryAsyncLink {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::time::Duration;

    use cardlink_core::{Action, EventPollStrategy, Node, NodeError};
    use cardlink_node::{SyncClientNode, SyncClientOptions};
    use tokio::sync::mpsc as tokio_mpsc;

    use super::*;

    struct NullHandler;

    #[async_trait]
    impl MessageHandler for NullHandler {
        async fn on_message(&self, _message: Message) {}
    }

    struct ChannelHandler {
        tx: tokio_mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl MessageHandler for ChannelHandler {
        async fn on_message(&self, message: Message) {
            let _ = self.tx.send(message);
        }
    }

    /// Server-side handler answering every inbound call with an echo.
    struct EchoHandler {
        node: OnceLock<Arc<SyncServerNode>>,
    }

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn on_message(&self, message: Message) {
            let Some(node) = self.node.get() else { return };
            let reply = Message::new(&message.session_id, message.action.clone())
                .with_body(format!("echo:{}", message.body));
            if let Err(e) = node.send_message(reply).await {
                tracing::error!(error = %e, "echo reply failed");
            }
        }
    }

    #[tokio::test]
    async fn test_sync_round_trip() {
        let handler = Arc::new(EchoHandler {
            node: OnceLock::new(),
        });
        let server = Arc::new(SyncServerNode::new(
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
            &NodeOptions::new(),
        ));
        let _ = handler.node.set(Arc::clone(&server));

        let client = SyncClientNode::start(
            Arc::new(MemorySyncEndpoint::new(server)),
            Arc::new(NullHandler),
            &SyncClientOptions::new(),
        );

        let reply = client
            .send_request(Message::new("s1", Action::Transmit).with_body("PING"))
            .await
            .unwrap();
        assert_eq!(reply.body, "echo:PING");
        assert!(!reply.server_node_id.is_empty());

        // The session survives for further exchanges.
        let reply = client
            .send_request(Message::new("s1", Action::Transmit).with_body("AGAIN"))
            .await
            .unwrap();
        assert_eq!(reply.body, "echo:AGAIN");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_event_delivery_through_poller() {
        let server = Arc::new(SyncServerNode::new(
            Arc::new(NullHandler),
            &NodeOptions::new(),
        ));
        let (tx, mut rx) = tokio_mpsc::unbounded_channel();

        let client = SyncClientNode::start(
            Arc::new(MemorySyncEndpoint::new(Arc::clone(&server))),
            Arc::new(ChannelHandler { tx }),
            &SyncClientOptions::new().observe_reader_events(EventPollStrategy::LongPolling {
                wait: Duration::from_secs(5),
            }),
        );

        server
            .send_message(
                Message::new("evt-1", Action::ReaderEvent)
                    .with_client_node_id(client.node_id())
                    .with_body("CARD_INSERTED"),
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, Action::ReaderEvent);
        assert_eq!(event.body, "CARD_INSERTED");
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (server_tx, mut server_rx) = tokio_mpsc::unbounded_channel();
        let link = MemoryAsyncLink::connect(
            Arc::new(NullHandler),
            Arc::new(ChannelHandler { tx: server_tx }),
            &NodeOptions::new().with_timeout(Duration::from_secs(2)),
        );

        link.client.open_session("s1").await.unwrap();

        let requester = {
            let client = Arc::clone(&link.client);
            tokio::spawn(async move {
                client
                    .send_request(Message::new("s1", Action::Transmit).with_body("SELECT"))
                    .await
            })
        };

        // The server handler sees the request and answers over its node.
        let inbound = server_rx.recv().await.unwrap();
        assert_eq!(inbound.body, "SELECT");
        link.server
            .send_message(Message::new(&inbound.session_id, Action::Transmit).with_body("9000"))
            .await
            .unwrap();

        let reply = requester.await.unwrap().unwrap();
        assert_eq!(reply.body, "9000");
        assert_eq!(reply.server_node_id, link.server.node_id());
    }

    #[tokio::test]
    async fn test_async_event_push() {
        let (client_tx, mut client_rx) = tokio_mpsc::unbounded_channel();
        let (server_tx, mut server_rx) = tokio_mpsc::unbounded_channel();
        let link = MemoryAsyncLink::connect(
            Arc::new(ChannelHandler { tx: client_tx }),
            Arc::new(ChannelHandler { tx: server_tx }),
            &NodeOptions::new().with_timeout(Duration::from_secs(2)),
        );

        link.client.open_session("s1").await.unwrap();
        // Establish the session on the server side with a first message.
        link.client
            .send_message(Message::new("s1", Action::Transmit).with_body("HELLO"))
            .await
            .unwrap();
        server_rx.recv().await.unwrap();

        // An async server pushes events directly over the session.
        link.server
            .send_message(Message::new("s1", Action::ReaderEvent).with_body("CARD_REMOVED"))
            .await
            .unwrap();

        let event = client_rx.recv().await.unwrap();
        assert_eq!(event.action, Action::ReaderEvent);
        assert_eq!(event.body, "CARD_REMOVED");
    }

    #[tokio::test]
    async fn test_async_close_tears_down_both_sides() {
        let (server_tx, mut server_rx) = tokio_mpsc::unbounded_channel();
        let link = MemoryAsyncLink::connect(
            Arc::new(NullHandler),
            Arc::new(ChannelHandler { tx: server_tx }),
            &NodeOptions::new().with_timeout(Duration::from_secs(2)),
        );

        link.client.open_session("s1").await.unwrap();
        link.client
            .send_message(Message::new("s1", Action::Transmit))
            .await
            .unwrap();
        server_rx.recv().await.unwrap();

        link.client.close_session("s1").await.unwrap();

        // Both nodes dropped the session.
        let err = link
            .server
            .send_message(Message::new("s1", Action::Transmit))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ClosedSession(_)));
        let err = link
            .client
            .send_message(Message::new("s1", Action::Transmit))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ClosedSession(_)));
    }
}
