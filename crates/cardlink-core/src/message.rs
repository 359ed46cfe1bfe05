//! Wire envelope exchanged between nodes.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Action carried by a [`Message`].
///
/// The transport gives special treatment to the closed set below; every other
/// action string is carried opaquely as [`Action::Other`] and interpreted by
/// the handler layer alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Card command request/response exchange.
    Transmit,
    /// Pushed reader state-change notification.
    ReaderEvent,
    /// Pushed plugin state-change notification.
    PluginEvent,
    /// Pull request for pending reader events (sync transport only).
    CheckReaderEvent,
    /// Pull request for pending plugin events (sync transport only).
    CheckPluginEvent,
    /// Serialized failure descriptor; the receiver must re-raise it.
    Error,
    /// Domain-specific action the transport carries opaquely.
    Other(String),
}

impl Action {
    /// Wire form of the action (case-sensitive).
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Transmit => "TRANSMIT",
            Self::ReaderEvent => "READER_EVENT",
            Self::PluginEvent => "PLUGIN_EVENT",
            Self::CheckReaderEvent => "CHECK_READER_EVENT",
            Self::CheckPluginEvent => "CHECK_PLUGIN_EVENT",
            Self::Error => "ERROR",
            Self::Other(s) => s,
        }
    }

    /// Whether this is a pushed event notification.
    #[must_use]
    pub const fn is_event(&self) -> bool {
        matches!(self, Self::ReaderEvent | Self::PluginEvent)
    }

    /// Whether this is a sync-transport event pull request.
    #[must_use]
    pub const fn is_event_check(&self) -> bool {
        matches!(self, Self::CheckReaderEvent | Self::CheckPluginEvent)
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "TRANSMIT" => Self::Transmit,
            "READER_EVENT" => Self::ReaderEvent,
            "PLUGIN_EVENT" => Self::PluginEvent,
            "CHECK_READER_EVENT" => Self::CheckReaderEvent,
            "CHECK_PLUGIN_EVENT" => Self::CheckPluginEvent,
            "ERROR" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Wire envelope exchanged between two nodes.
///
/// Immutable once sent. The `body` is an opaque payload interpreted only by
/// the handler layer; node ids identify the two endpoints once the handshake
/// has occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Logical session this message belongs to.
    pub session_id: String,
    /// Action carried by the message.
    pub action: Action,
    /// Identity of the client endpoint.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_node_id: String,
    /// Identity of the server endpoint.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_node_id: String,
    /// Opaque payload, may be empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

impl Message {
    /// Create a message with empty node ids and body.
    #[must_use]
    pub fn new(session_id: impl Into<String>, action: Action) -> Self {
        Self {
            session_id: session_id.into(),
            action,
            client_node_id: String::new(),
            server_node_id: String::new(),
            body: String::new(),
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Stamp the client endpoint identity.
    #[must_use]
    pub fn with_client_node_id(mut self, id: impl Into<String>) -> Self {
        self.client_node_id = id.into();
        self
    }

    /// Stamp the server endpoint identity.
    #[must_use]
    pub fn with_server_node_id(mut self, id: impl Into<String>) -> Self {
        self.server_node_id = id.into();
        self
    }

    /// Build an `ERROR` reply for this message carrying a failure descriptor.
    ///
    /// Session and node ids are preserved so the receiver can route the
    /// failure to the waiting caller.
    #[must_use]
    pub fn error_reply(&self, descriptor: impl Into<String>) -> Self {
        Self {
            session_id: self.session_id.clone(),
            action: Action::Error,
            client_node_id: self.client_node_id.clone(),
            server_node_id: self.server_node_id.clone(),
            body: descriptor.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_roundtrip() {
        for action in [
            Action::Transmit,
            Action::ReaderEvent,
            Action::PluginEvent,
            Action::CheckReaderEvent,
            Action::CheckPluginEvent,
            Action::Error,
        ] {
            assert_eq!(Action::from(action.as_str()), action);
        }
    }

    #[test]
    fn test_unknown_action_is_opaque() {
        let action = Action::from("EXECUTE_REMOTE_SERVICE");
        assert_eq!(action, Action::Other("EXECUTE_REMOTE_SERVICE".to_string()));
        assert_eq!(action.as_str(), "EXECUTE_REMOTE_SERVICE");
        assert!(!action.is_event());
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::new("session-1", Action::Transmit)
            .with_client_node_id("client-a")
            .with_body("00A404000E");

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""action":"TRANSMIT""#));
        assert!(json.contains(r#""sessionId":"session-1""#));
        assert!(json.contains(r#""clientNodeId":"client-a""#));
        // Empty fields stay off the wire.
        assert!(!json.contains("serverNodeId"));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_opaque_action_serialization() {
        let msg = Message::new("s", Action::Other("RELEASE_READER".to_string()));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""action":"RELEASE_READER""#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.action.as_str(), "RELEASE_READER");
    }

    #[test]
    fn test_error_reply_preserves_routing() {
        let msg = Message::new("session-9", Action::Transmit)
            .with_client_node_id("c1")
            .with_server_node_id("s1");
        let err = msg.error_reply("reader unavailable");

        assert_eq!(err.action, Action::Error);
        assert_eq!(err.session_id, "session-9");
        assert_eq!(err.client_node_id, "c1");
        assert_eq!(err.server_node_id, "s1");
        assert_eq!(err.body, "reader unavailable");
    }
}
