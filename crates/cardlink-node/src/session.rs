//! Per-session state machine correlating outbound calls with inbound replies.
//!
//! One `SessionManager` exists per active session id per node. Every state
//! transition happens under the manager's mutex; waits register a watch
//! receiver before re-checking their predicate, so a transition can never be
//! missed between the check and the sleep.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cardlink_core::{Message, NodeError};
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Lifecycle state of one logical session on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Initialized,
    OpenSessionBegin,
    OpenSessionEnd,
    SendRequestBegin,
    SendRequestEnd,
    SendMessage,
    OnRequest,
    OnMessage,
    CloseSessionBegin,
    CloseSessionEnd,
    ExternalErrorOccurred,
    AbortedSession,
}

impl SessionState {
    /// States in which a caller is suspended waiting for the counterpart.
    pub(crate) const fn is_begin(self) -> bool {
        matches!(
            self,
            Self::OpenSessionBegin | Self::SendRequestBegin | Self::CloseSessionBegin
        )
    }

    const fn is_defunct(self) -> bool {
        matches!(self, Self::ExternalErrorOccurred | Self::AbortedSession)
    }
}

struct Inner {
    state: SessionState,
    /// State to restore when a begin phase times out (async roles recover).
    prev_state: SessionState,
    /// Single-slot reply storage, overwritten per request cycle.
    response: Option<Message>,
    /// Reply set under construction for the current sync-server inbound call.
    outbox: Vec<Message>,
    /// Transport failure captured by `on_error`, surfaced exactly once.
    error: Option<String>,
}

pub(crate) struct SessionManager {
    session_id: String,
    timeout: Duration,
    inner: Mutex<Inner>,
    changed: watch::Sender<()>,
}

impl SessionManager {
    pub(crate) fn new(session_id: impl Into<String>, timeout: Duration) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            session_id: session_id.into(),
            timeout,
            inner: Mutex::new(Inner {
                state: SessionState::Initialized,
                prev_state: SessionState::Initialized,
                response: None,
                outbox: Vec::new(),
                error: None,
            }),
            changed,
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_changed(&self) {
        self.changed.send_replace(());
    }

    /// Surface a stored transport failure.
    ///
    /// The first access after `on_error` consumes the flag and converts the
    /// state to `AbortedSession`; every later access fails fast with the
    /// retained detail, without contacting the transport.
    fn consume_error(&self, inner: &mut Inner) -> Result<(), NodeError> {
        match inner.state {
            SessionState::ExternalErrorOccurred => {
                inner.state = SessionState::AbortedSession;
                let detail = inner
                    .error
                    .clone()
                    .unwrap_or_else(|| "transport failure".to_string());
                Err(NodeError::Communication(detail))
            }
            SessionState::AbortedSession => {
                let detail = inner.error.as_deref().unwrap_or("transport failure");
                Err(NodeError::Communication(format!(
                    "session `{}` aborted: {detail}",
                    self.session_id
                )))
            }
            _ => Ok(()),
        }
    }

    /// Enter a begin phase from any stable state.
    ///
    /// Rejects overlap with another begin phase: no two callers may be
    /// suspended on the same manager at once.
    pub(crate) fn begin(&self, target: SessionState) -> Result<(), NodeError> {
        let mut inner = self.lock();
        self.consume_error(&mut inner)?;
        if inner.state.is_begin() {
            return Err(NodeError::ProtocolViolation(format!(
                "cannot enter {target:?} on session `{}` while in {:?}",
                self.session_id, inner.state
            )));
        }
        inner.prev_state = inner.state;
        inner.state = target;
        if target == SessionState::SendRequestBegin {
            inner.response = None;
        }
        drop(inner);
        self.notify_changed();
        Ok(())
    }

    /// Enter a begin phase from an explicit set of allowed states.
    pub(crate) fn begin_from(
        &self,
        target: SessionState,
        expected: &[SessionState],
    ) -> Result<(), NodeError> {
        let mut inner = self.lock();
        self.consume_error(&mut inner)?;
        if !expected.contains(&inner.state) {
            return Err(NodeError::ProtocolViolation(format!(
                "cannot enter {target:?} on session `{}` from {:?}",
                self.session_id, inner.state
            )));
        }
        inner.prev_state = inner.state;
        inner.state = target;
        if target == SessionState::SendRequestBegin {
            inner.response = None;
        }
        drop(inner);
        self.notify_changed();
        Ok(())
    }

    /// Enter `SendRequestBegin` and queue `message` into the reply set of the
    /// pending (or next) inbound call, waiting for any in-flight
    /// server-initiated request to complete first.
    ///
    /// Used by the sync server, where tunneled exchanges on one session must
    /// be serialized rather than left racing.
    pub(crate) async fn begin_request_queued(&self, message: Message) -> Result<(), NodeError> {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.changed.subscribe();
        loop {
            {
                let mut inner = self.lock();
                self.consume_error(&mut inner)?;
                // The previous exchange is over only once its waiter has
                // taken the reply out of the slot.
                if inner.state != SessionState::SendRequestBegin && inner.response.is_none() {
                    inner.prev_state = inner.state;
                    inner.state = SessionState::SendRequestBegin;
                    inner.outbox.push(message);
                    drop(inner);
                    self.notify_changed();
                    return Ok(());
                }
            }
            if time::timeout_at(deadline, rx.changed()).await.is_err() {
                return Err(NodeError::Timeout(self.timeout));
            }
        }
    }

    /// Record a transition driven by a transport callback (`on_open`,
    /// `on_close`). Ignored once the session is defunct.
    pub(crate) fn set_state(&self, state: SessionState) {
        let mut inner = self.lock();
        if inner.state.is_defunct() {
            return;
        }
        inner.state = state;
        drop(inner);
        self.notify_changed();
    }

    /// Offer an inbound message as the reply to a pending `send_request`.
    ///
    /// Consumes the message and completes the waiter when the manager is in
    /// `SendRequestBegin`; otherwise hands the message back so the caller can
    /// treat it as an unsolicited inbound call.
    pub(crate) fn try_complete_request(&self, message: Message) -> Option<Message> {
        let mut inner = self.lock();
        if inner.state == SessionState::SendRequestBegin {
            inner.response = Some(message);
            inner.state = SessionState::SendRequestEnd;
            drop(inner);
            self.notify_changed();
            None
        } else {
            Some(message)
        }
    }

    /// Record an unsolicited inbound message about to be forwarded to the
    /// handler. The state is left untouched while a begin phase is waiting so
    /// its bookkeeping survives interleaved traffic.
    pub(crate) fn record_unsolicited(&self, state: SessionState) -> Result<(), NodeError> {
        let mut inner = self.lock();
        if inner.state.is_defunct() {
            let detail = inner.error.as_deref().unwrap_or("transport failure");
            return Err(NodeError::Communication(format!(
                "session `{}` aborted: {detail}",
                self.session_id
            )));
        }
        if !inner.state.is_begin() {
            inner.state = state;
        }
        drop(inner);
        self.notify_changed();
        Ok(())
    }

    /// Accept a fresh inbound call on a sync-server session.
    ///
    /// Only an idle session may receive a new call: the previous exchange
    /// must have completed (or been tunneled through `try_complete_request`).
    pub(crate) fn accept_request(&self) -> Result<(), NodeError> {
        let mut inner = self.lock();
        self.consume_error(&mut inner)?;
        if inner.state != SessionState::Initialized {
            return Err(NodeError::ProtocolViolation(format!(
                "inbound call on session `{}` while in {:?}",
                self.session_id, inner.state
            )));
        }
        inner.state = SessionState::OnRequest;
        drop(inner);
        self.notify_changed();
        Ok(())
    }

    /// Record a fire-and-forget send. Fails fast when the session already
    /// carries an unconsumed transport failure.
    pub(crate) fn mark_send_message(&self) -> Result<(), NodeError> {
        let mut inner = self.lock();
        self.consume_error(&mut inner)?;
        if !inner.state.is_begin() {
            inner.state = SessionState::SendMessage;
        }
        drop(inner);
        self.notify_changed();
        Ok(())
    }

    /// Append a reply to the set under construction for the pending inbound
    /// call (sync server).
    pub(crate) fn post_reply(&self, message: Message) -> Result<(), NodeError> {
        let mut inner = self.lock();
        self.consume_error(&mut inner)?;
        if !inner.state.is_begin() {
            inner.state = SessionState::SendMessage;
        }
        inner.outbox.push(message);
        drop(inner);
        self.notify_changed();
        Ok(())
    }

    /// Capture a transport failure and wake any waiter. The failure surfaces
    /// exactly once, to the first subsequent access.
    pub(crate) fn on_error(&self, detail: impl Into<String>) {
        let mut inner = self.lock();
        if inner.state == SessionState::AbortedSession {
            return;
        }
        inner.error = Some(detail.into());
        inner.state = SessionState::ExternalErrorOccurred;
        drop(inner);
        self.notify_changed();
    }

    /// Abort the session on behalf of the failing caller itself and return
    /// the error to raise. Used when the outbound transport call fails
    /// synchronously: the caller is both the witness and the consumer.
    pub(crate) fn fail(&self, detail: impl Into<String>) -> NodeError {
        let detail = detail.into();
        let mut inner = self.lock();
        inner.error = Some(detail.clone());
        inner.state = SessionState::AbortedSession;
        drop(inner);
        self.notify_changed();
        NodeError::Communication(detail)
    }

    pub(crate) fn is_defunct(&self) -> bool {
        self.lock().state.is_defunct()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    async fn wait_until<T>(
        &self,
        mut ready: impl FnMut(&mut Inner) -> Option<T>,
        on_timeout: impl FnOnce(&mut Inner),
    ) -> Result<T, NodeError> {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.changed.subscribe();
        loop {
            {
                let mut inner = self.lock();
                self.consume_error(&mut inner)?;
                if let Some(value) = ready(&mut inner) {
                    drop(inner);
                    // Consuming the slot is itself a transition others may be
                    // waiting on (e.g. a queued server-initiated request).
                    self.notify_changed();
                    return Ok(value);
                }
            }
            if time::timeout_at(deadline, rx.changed()).await.is_err() {
                let mut inner = self.lock();
                on_timeout(&mut inner);
                return Err(NodeError::Timeout(self.timeout));
            }
        }
    }

    /// Suspend until the manager reaches `target`.
    ///
    /// A timeout rolls an unanswered begin phase back to the state it started
    /// from, leaving the session usable again.
    pub(crate) async fn wait_for_state(&self, target: SessionState) -> Result<(), NodeError> {
        self.wait_until(
            |inner| (inner.state == target).then_some(()),
            |inner| {
                if inner.state.is_begin() {
                    inner.state = inner.prev_state;
                }
            },
        )
        .await
    }

    /// Suspend until the counterpart's reply lands in the response slot.
    pub(crate) async fn wait_for_reply(&self) -> Result<Message, NodeError> {
        self.wait_until(
            |inner| inner.response.take(),
            |inner| {
                if inner.state == SessionState::SendRequestBegin {
                    inner.state = inner.prev_state;
                }
            },
        )
        .await
    }

    /// Suspend until at least one reply is queued, then drain the whole set
    /// atomically (sync server).
    pub(crate) async fn wait_outbox(&self) -> Result<Vec<Message>, NodeError> {
        self.wait_until(
            |inner| {
                if inner.outbox.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut inner.outbox))
                }
            },
            |_| {},
        )
        .await
    }

    /// Return to `Initialized` after a completed sync-server cycle, unless a
    /// server-initiated request is still in flight.
    pub(crate) fn reset_if_idle(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::SendRequestBegin && !inner.state.is_defunct() {
            inner.state = SessionState::Initialized;
            drop(inner);
            self.notify_changed();
        }
    }
}
