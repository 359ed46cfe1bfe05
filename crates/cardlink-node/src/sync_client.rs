//! Client node for request/response transports.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cardlink_core::{
    Action, EventPollStrategy, IdGenerator, Message, MessageHandler, Node, NodeError,
    SyncClientEndpoint,
};
use tokio::task::JoinHandle;
use tokio::time;

use crate::backoff::FibonacciBackoff;
use crate::options::SyncClientOptions;

/// Client endpoint of a synchronous transport.
///
/// Always the initiator: the remote side can only answer inline, so there is
/// no per-session wait state. Push events are received despite the transport
/// being pull-only by running one background check task per observed event
/// category; a task that loses connectivity retries forever with Fibonacci
/// backoff and resumes once the endpoint answers again.
pub struct SyncClientNode {
    node_id: String,
    server_node_id: Mutex<Option<String>>,
    endpoint: Arc<dyn SyncClientEndpoint>,
    pollers: Vec<JoinHandle<()>>,
}

impl SyncClientNode {
    /// Create the node and start its event pollers.
    ///
    /// Pollers run until the node is dropped.
    #[must_use]
    pub fn start(
        endpoint: Arc<dyn SyncClientEndpoint>,
        handler: Arc<dyn MessageHandler>,
        options: &SyncClientOptions,
    ) -> Self {
        let node_id = options.node.id_generator.generate();

        let mut pollers = Vec::new();
        let categories = [
            (Action::CheckPluginEvent, options.plugin_events),
            (Action::CheckReaderEvent, options.reader_events),
        ];
        for (action, strategy) in categories {
            let Some(strategy) = strategy else { continue };
            let poller = EventPoller {
                endpoint: Arc::clone(&endpoint),
                handler: Arc::clone(&handler),
                id_generator: Arc::clone(&options.node.id_generator),
                node_id: node_id.clone(),
                action,
                strategy,
                retry_unit: options.retry_unit,
            };
            pollers.push(tokio::spawn(poller.run()));
        }

        Self {
            node_id,
            server_node_id: Mutex::new(None),
            endpoint,
            pollers,
        }
    }

    fn stamp(&self, message: &mut Message) {
        message.client_node_id = self.node_id.clone();
        let server_id = self
            .server_node_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(server_id) = server_id {
            message.server_node_id = server_id;
        }
    }

    fn record_server_id(&self, reply: &Message) {
        if reply.server_node_id.is_empty() {
            return;
        }
        let mut guard = self
            .server_node_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(reply.server_node_id.clone());
        }
    }
}

impl Drop for SyncClientNode {
    fn drop(&mut self) {
        for poller in &self.pollers {
            poller.abort();
        }
    }
}

#[async_trait]
impl Node for SyncClientNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Deliver a message and return the single inline reply.
    ///
    /// # Errors
    /// Zero or more than one reply message is a `ProtocolViolation`; an
    /// `ERROR` reply is re-raised as `Communication`. Transport failures are
    /// never retried here: the handler decides whether to retry the whole
    /// business operation.
    async fn send_request(&self, mut message: Message) -> Result<Message, NodeError> {
        self.stamp(&mut message);
        let mut replies = self.endpoint.send_request(message).await?;
        if replies.len() != 1 {
            return Err(NodeError::ProtocolViolation(format!(
                "expected exactly one reply, got {}",
                replies.len()
            )));
        }
        let reply = replies.remove(0);
        self.record_server_id(&reply);
        if reply.action == Action::Error {
            return Err(NodeError::Communication(format!(
                "remote endpoint reported: {}",
                reply.body
            )));
        }
        Ok(reply)
    }

    /// Deliver a message, discarding any inline replies.
    async fn send_message(&self, mut message: Message) -> Result<(), NodeError> {
        self.stamp(&mut message);
        let replies = self.endpoint.send_request(message).await?;
        if !replies.is_empty() {
            tracing::warn!(count = replies.len(), "replies to one-way message discarded");
        }
        Ok(())
    }
}

/// Background task pulling one category of push events.
struct EventPoller {
    endpoint: Arc<dyn SyncClientEndpoint>,
    handler: Arc<dyn MessageHandler>,
    id_generator: Arc<dyn IdGenerator>,
    node_id: String,
    action: Action,
    strategy: EventPollStrategy,
    retry_unit: Duration,
}

impl EventPoller {
    async fn run(self) {
        // The strategy is advertised in the first check call's body and
        // re-advertised after any failure, in case the remote side lost its
        // mailbox state.
        let mut negotiated = false;
        let mut backoff = FibonacciBackoff::new(self.retry_unit);
        loop {
            let mut message = Message::new(self.id_generator.generate(), self.action.clone())
                .with_client_node_id(self.node_id.clone());
            if !negotiated {
                message = message.with_body(self.strategy.negotiation_body());
            }

            match self.endpoint.send_request(message).await {
                Ok(events) => {
                    negotiated = true;
                    backoff.reset();
                    for event in events {
                        if event.action.is_event() {
                            self.handler.on_message(event).await;
                        } else {
                            tracing::warn!(
                                action = %event.action,
                                "non-event reply to event check discarded"
                            );
                        }
                    }
                    if let EventPollStrategy::Polling { interval } = self.strategy {
                        time::sleep(interval).await;
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        action = %self.action,
                        error = %e,
                        ?delay,
                        "event check failed, backing off"
                    );
                    negotiated = false;
                    time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cardlink_core::{TransportError, UuidIdGenerator};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use crate::options::NodeOptions;

    use super::*;

    struct ScriptedEndpoint {
        replies: Mutex<VecDeque<Result<Vec<Message>, TransportError>>>,
        sent: Mutex<Vec<Message>>,
    }

    impl ScriptedEndpoint {
        fn new(replies: Vec<Result<Vec<Message>, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SyncClientEndpoint for ScriptedEndpoint {
        async fn send_request(&self, message: Message) -> Result<Vec<Message>, TransportError> {
            self.sent.lock().unwrap().push(message);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::new("script exhausted")))
        }
    }

    struct NullHandler;

    #[async_trait]
    impl MessageHandler for NullHandler {
        async fn on_message(&self, _message: Message) {}
    }

    struct ChannelHandler {
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl MessageHandler for ChannelHandler {
        async fn on_message(&self, message: Message) {
            let _ = self.tx.send(message);
        }
    }

    fn reply(body: &str) -> Message {
        Message::new("s1", Action::Transmit)
            .with_server_node_id("server-1")
            .with_body(body)
    }

    fn plain_node(endpoint: Arc<ScriptedEndpoint>) -> SyncClientNode {
        SyncClientNode::start(endpoint, Arc::new(NullHandler), &SyncClientOptions::new())
    }

    #[tokio::test]
    async fn test_single_reply_returned() {
        let endpoint = ScriptedEndpoint::new(vec![Ok(vec![reply("9000")])]);
        let node = plain_node(Arc::clone(&endpoint));

        let out = node
            .send_request(Message::new("s1", Action::Transmit))
            .await
            .unwrap();
        assert_eq!(out.body, "9000");
        // Outbound messages carry the client identity.
        assert_eq!(endpoint.sent.lock().unwrap()[0].client_node_id, node.node_id());
    }

    #[tokio::test]
    async fn test_zero_or_many_replies_are_protocol_violations() {
        let endpoint = ScriptedEndpoint::new(vec![
            Ok(vec![]),
            Ok(vec![reply("a"), reply("b")]),
        ]);
        let node = plain_node(endpoint);

        for _ in 0..2 {
            let err = node
                .send_request(Message::new("s1", Action::Transmit))
                .await
                .unwrap_err();
            assert!(matches!(err, NodeError::ProtocolViolation(_)));
        }
    }

    #[tokio::test]
    async fn test_error_reply_is_reraised() {
        let endpoint = ScriptedEndpoint::new(vec![Ok(vec![
            Message::new("s1", Action::Error).with_body("card removed"),
        ])]);
        let node = plain_node(endpoint);

        let err = node
            .send_request(Message::new("s1", Action::Transmit))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Communication(ref d) if d.contains("card removed")));
    }

    #[tokio::test]
    async fn test_server_identity_learned_from_first_reply() {
        let endpoint = ScriptedEndpoint::new(vec![
            Ok(vec![reply("first")]),
            Ok(vec![reply("second")]),
        ]);
        let node = plain_node(Arc::clone(&endpoint));

        node.send_request(Message::new("s1", Action::Transmit))
            .await
            .unwrap();
        node.send_request(Message::new("s1", Action::Transmit))
            .await
            .unwrap();

        let sent = endpoint.sent.lock().unwrap();
        assert!(sent[0].server_node_id.is_empty());
        assert_eq!(sent[1].server_node_id, "server-1");
    }

    #[tokio::test]
    async fn test_transport_failure_not_retried_on_request_path() {
        let endpoint = ScriptedEndpoint::new(vec![Err(TransportError::new("offline"))]);
        let node = plain_node(Arc::clone(&endpoint));

        let err = node
            .send_request(Message::new("s1", Action::Transmit))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Communication(_)));
        assert_eq!(endpoint.sent.lock().unwrap().len(), 1);
    }

    /// Endpoint for poller tests: fails the first `failures` calls, then
    /// answers every call with an empty event list, recording call instants.
    struct FlakyEndpoint {
        failures: AtomicUsize,
        calls: Mutex<Vec<(Instant, String)>>,
    }

    #[async_trait]
    impl SyncClientEndpoint for FlakyEndpoint {
        async fn send_request(&self, message: Message) -> Result<Vec<Message>, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), message.body.clone()));
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(TransportError::new("connection refused"))
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_retries_with_fibonacci_delays() {
        let endpoint = Arc::new(FlakyEndpoint {
            failures: AtomicUsize::new(5),
            calls: Mutex::new(Vec::new()),
        });
        let options = SyncClientOptions::new()
            .observe_reader_events(EventPollStrategy::Polling {
                // Park the poller after the first success.
                interval: Duration::from_secs(3600),
            })
            .with_retry_unit(Duration::from_secs(1));
        let _node = SyncClientNode::start(
            Arc::clone(&endpoint) as Arc<dyn SyncClientEndpoint>,
            Arc::new(NullHandler),
            &options,
        );

        // Let the poller burn through the five failures and succeed once.
        for _ in 0..100 {
            if endpoint.calls.lock().unwrap().len() >= 6 {
                break;
            }
            time::sleep(Duration::from_millis(500)).await;
        }

        let calls = endpoint.calls.lock().unwrap();
        assert!(calls.len() >= 6, "expected 6 attempts, saw {}", calls.len());
        let gaps: Vec<u64> = calls
            .windows(2)
            .take(5)
            .map(|w| (w[1].0 - w[0].0).as_secs())
            .collect();
        assert_eq!(gaps, [0, 1, 1, 2, 3]);

        // The strategy is advertised on the first call and re-advertised
        // after every failure.
        for (_, body) in calls.iter().take(6) {
            assert!(body.contains("POLLING"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_forwards_events_to_handler() {
        let event = Message::new("evt-1", Action::ReaderEvent).with_body("CARD_INSERTED");
        let endpoint = ScriptedEndpoint::new(vec![Ok(vec![event])]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let options = SyncClientOptions {
            node: NodeOptions::new().with_id_generator(Arc::new(UuidIdGenerator)),
            plugin_events: None,
            reader_events: Some(EventPollStrategy::LongPolling {
                wait: Duration::from_secs(10),
            }),
            retry_unit: Duration::from_secs(1),
        };
        let _node = SyncClientNode::start(
            Arc::clone(&endpoint) as Arc<dyn SyncClientEndpoint>,
            Arc::new(ChannelHandler { tx }),
            &options,
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.action, Action::ReaderEvent);
        assert_eq!(received.body, "CARD_INSERTED");

        // The first check call negotiated long polling.
        let sent = endpoint.sent.lock().unwrap();
        assert!(sent[0].body.contains("LONG_POLLING"));
        assert!(sent[0].body.contains("10"));
    }
}
