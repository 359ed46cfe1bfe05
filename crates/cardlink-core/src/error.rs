//! Error taxonomy shared by every node role.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a transport endpoint.
#[derive(Debug, Clone, Error)]
#[error("transport failure: {0}")]
pub struct TransportError(String);

impl TransportError {
    /// Wrap an underlying transport failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error surfaced by node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A blocking wait exceeded its bound. Recoverable: the caller may retry
    /// or abandon the session.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// Operation attempted on a session id with no live manager.
    #[error("no active session `{0}`")]
    ClosedSession(String),
    /// The transport signalled failure, or the remote side answered with a
    /// serialized error. Terminal for the affected session.
    #[error("remote communication failure: {0}")]
    Communication(String),
    /// A misbehaving endpoint broke the exchange contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        Self::Communication(err.to_string())
    }
}
