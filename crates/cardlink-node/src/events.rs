//! Per-client event mailbox used by the sync server to emulate push.

use std::sync::{Mutex, MutexGuard, PoisonError};

use cardlink_core::{EventPollStrategy, Message, NodeError};
use tokio::sync::watch;
use tokio::time::{self, Instant};

struct Inner {
    /// Strategy fixed by the first check call for the life of the mailbox.
    strategy: Option<EventPollStrategy>,
    /// Events pending delivery, append-only until drained.
    pending: Vec<Message>,
}

/// Mailbox holding pushed events for one remote client node.
///
/// The server posts events here instead of sending them; the client's check
/// calls drain the mailbox, optionally blocking (long polling) until an event
/// exists or the negotiated bound elapses.
pub(crate) struct ServerPushEventManager {
    inner: Mutex<Inner>,
    changed: watch::Sender<()>,
}

impl ServerPushEventManager {
    pub(crate) fn new() -> Self {
        let (changed, _) = watch::channel(());
        Self {
            inner: Mutex::new(Inner {
                strategy: None,
                pending: Vec::new(),
            }),
            changed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event and wake any long-poll waiter.
    pub(crate) fn post(&self, message: Message) {
        self.lock().pending.push(message);
        self.changed.send_replace(());
    }

    /// Drain pending events for a check call.
    ///
    /// Under `LONG_POLLING` the call is held open until an event is posted or
    /// the negotiated wait elapses; the drain always clears the mailbox
    /// atomically with the read.
    pub(crate) async fn check(&self, message: &Message) -> Result<Vec<Message>, NodeError> {
        let strategy = self.negotiate(message)?;

        let mut rx = self.changed.subscribe();
        if let Some(events) = self.drain() {
            return Ok(events);
        }
        let Some(wait) = strategy.long_poll_wait() else {
            return Ok(Vec::new());
        };

        let deadline = Instant::now() + wait;
        loop {
            if time::timeout_at(deadline, rx.changed()).await.is_err() {
                return Ok(Vec::new());
            }
            if let Some(events) = self.drain() {
                return Ok(events);
            }
        }
    }

    fn drain(&self) -> Option<Vec<Message>> {
        let mut inner = self.lock();
        if inner.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut inner.pending))
        }
    }

    /// Fix the delivery strategy on the first check call, reuse it after.
    fn negotiate(&self, message: &Message) -> Result<EventPollStrategy, NodeError> {
        let mut inner = self.lock();
        if let Some(strategy) = inner.strategy {
            return Ok(strategy);
        }
        if message.body.is_empty() {
            return Err(NodeError::ProtocolViolation(format!(
                "first {} call from `{}` carries no strategy",
                message.action, message.client_node_id
            )));
        }
        let strategy = EventPollStrategy::from_negotiation_body(&message.body)
            .map_err(|e| NodeError::ProtocolViolation(e.to_string()))?;
        inner.strategy = Some(strategy);
        Ok(strategy)
    }
}
