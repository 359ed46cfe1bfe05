//! Event-poll strategy negotiated between a sync client and server.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a synchronous client pulls server-originated events.
///
/// The strategy is fixed at poller construction and advertised to the server
/// inside the body of the first check call; the server reuses it for the life
/// of that client's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPollStrategy {
    /// Issue a check call every `interval`, returning immediately each time.
    ///
    /// The interval is client-local pacing and never crosses the wire.
    Polling {
        /// Delay between two consecutive check calls.
        interval: Duration,
    },
    /// Hold each check call open until an event arrives or `wait` elapses.
    LongPolling {
        /// Maximum time the server holds a check call open.
        wait: Duration,
    },
}

/// Malformed strategy negotiation body.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("malformed strategy body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("LONG_POLLING strategy missing duration")]
    MissingDuration,
}

#[derive(Debug, Serialize, Deserialize)]
struct NegotiationBody {
    strategy: StrategyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum StrategyKind {
    Polling,
    LongPolling,
}

impl EventPollStrategy {
    /// Wire form sent in the first check call's body.
    #[must_use]
    pub fn negotiation_body(&self) -> String {
        let body = match self {
            Self::Polling { .. } => serde_json::json!({ "strategy": "POLLING" }),
            Self::LongPolling { wait } => {
                serde_json::json!({ "strategy": "LONG_POLLING", "duration": wait.as_secs() })
            }
        };
        body.to_string()
    }

    /// Parse the strategy advertised in a first check call.
    ///
    /// A `POLLING` body yields a zero interval: the interval is sender-local
    /// pacing the server never learns.
    ///
    /// # Errors
    /// Returns an error if the body is not a valid negotiation payload.
    pub fn from_negotiation_body(body: &str) -> Result<Self, StrategyError> {
        let parsed: NegotiationBody = serde_json::from_str(body)?;
        match parsed.strategy {
            StrategyKind::Polling => Ok(Self::Polling {
                interval: Duration::ZERO,
            }),
            StrategyKind::LongPolling => {
                let secs = parsed.duration.ok_or(StrategyError::MissingDuration)?;
                Ok(Self::LongPolling {
                    wait: Duration::from_secs(secs),
                })
            }
        }
    }

    /// Maximum time the server may hold a check call open under this
    /// strategy, if any.
    #[must_use]
    pub const fn long_poll_wait(&self) -> Option<Duration> {
        match self {
            Self::Polling { .. } => None,
            Self::LongPolling { wait } => Some(*wait),
        }
    }
}
