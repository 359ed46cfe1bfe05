//! Handler and transport-endpoint contracts.
//!
//! The handler is the domain layer (reader/plugin virtualization logic)
//! sitting above a node; the endpoints are the wire bindings supplied by the
//! embedding application below it. The transport core only ever sees these
//! traits.

use async_trait::async_trait;

use crate::error::{NodeError, TransportError};
use crate::message::Message;

/// Uniform node surface consumed by the handler layer.
///
/// Every role implements this pair of outbound operations; session lifecycle
/// (open/close handshakes, transport callbacks) stays role-specific.
#[async_trait]
pub trait Node: Send + Sync {
    /// Identity of this endpoint.
    fn node_id(&self) -> &str;

    /// Deliver a message and suspend until the counterpart's reply arrives.
    async fn send_request(&self, message: Message) -> Result<Message, NodeError>;

    /// Deliver a message without waiting for a reply.
    async fn send_message(&self, message: Message) -> Result<(), NodeError>;
}

/// Domain-level consumer of inbound messages.
///
/// Invoked by a node for every inbound message that is not consumed as the
/// reply to a pending call. Implementations must not block indefinitely.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process an unsolicited inbound message.
    async fn on_message(&self, message: Message);
}

/// Client side of a full-duplex transport (e.g. a WebSocket connection).
///
/// The embedding application implements the outbound calls and drives the
/// node's `on_open`/`on_message`/`on_close`/`on_error` callbacks from its
/// receive loop.
#[async_trait]
pub trait AsyncClientEndpoint: Send + Sync {
    /// Open a communication session with the remote endpoint.
    async fn open_session(&self, session_id: &str) -> Result<(), TransportError>;

    /// Deliver a message to the remote endpoint.
    async fn send_message(&self, message: Message) -> Result<(), TransportError>;

    /// Close a previously opened session.
    async fn close_session(&self, session_id: &str) -> Result<(), TransportError>;
}

/// Server side of a full-duplex transport.
#[async_trait]
pub trait AsyncServerEndpoint: Send + Sync {
    /// Deliver a message to the remote client endpoint.
    async fn send_message(&self, message: Message) -> Result<(), TransportError>;
}

/// Client side of a request/response transport (e.g. HTTP).
///
/// The remote side can only answer inline: one outbound request yields the
/// complete list of messages the server had to say.
#[async_trait]
pub trait SyncClientEndpoint: Send + Sync {
    /// Deliver a message and collect the server's inline replies.
    async fn send_request(&self, message: Message) -> Result<Vec<Message>, TransportError>;
}
